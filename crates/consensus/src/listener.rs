//! Fan-out listener - feeds announcements and envelopes to their consumers

use crate::{election::Election, replication::Replicator, types::CoordinatorAnnouncement};
use mesh_bus::{FanOut, FanOutMessage, COORDINATOR_TOPIC, REPLICATION_TOPIC};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct FanOutListener {
    election: Arc<Election>,
    replicator: Arc<Replicator>,
}

impl FanOutListener {
    pub fn new(election: Arc<Election>, replicator: Arc<Replicator>) -> Self {
        Self {
            election,
            replicator,
        }
    }

    /// Subscribe to the coordinator and replication topics
    pub fn subscribe(bus: &dyn FanOut) -> mpsc::Receiver<FanOutMessage> {
        bus.subscribe(vec![
            COORDINATOR_TOPIC.to_string(),
            REPLICATION_TOPIC.to_string(),
        ])
    }

    /// Route one message
    pub fn dispatch(&self, message: FanOutMessage) {
        match message.topic.as_str() {
            COORDINATOR_TOPIC => match CoordinatorAnnouncement::from_payload(&message.payload) {
                Ok(announcement) => self.election.handle_announcement(&announcement),
                Err(e) => tracing::warn!("Dropping malformed announcement: {}", e),
            },
            REPLICATION_TOPIC => {
                self.replicator.apply_payload(message.payload);
            }
            other => tracing::debug!("Ignoring message on topic {}", other),
        }
    }

    /// Drain `rx` until the bus closes it
    pub async fn run(&self, mut rx: mpsc::Receiver<FanOutMessage>) {
        while let Some(message) = rx.recv().await {
            self.dispatch(message);
        }
        tracing::warn!("Fan-out subscription closed");
    }
}
