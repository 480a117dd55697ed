//! In-memory transports
//!
//! `LocalNetwork` routes requests to handlers registered under an address and
//! `LocalBus` fans messages out through a tokio broadcast channel. Both are
//! used to run whole clusters inside one process.

use crate::{
    error::BusError,
    message::{FanOutMessage, Reply, Request},
    transport::{FanOut, RequestChannel, RequestHandler},
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};

/// In-memory request/reply network
#[derive(Clone, Default)]
pub struct LocalNetwork {
    handlers: Arc<DashMap<String, Arc<dyn RequestHandler>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handler` reachable at `addr`
    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(addr.into(), handler);
    }

    /// Make `addr` unreachable (simulates a crashed process)
    pub fn unregister(&self, addr: &str) -> bool {
        self.handlers.remove(addr).is_some()
    }
}

#[async_trait]
impl RequestChannel for LocalNetwork {
    async fn request(&self, addr: &str, request: Request, timeout: Duration) -> Result<Reply, BusError> {
        // Clone out of the map so no shard lock is held across the await
        let handler = self
            .handlers
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BusError::Unreachable(addr.to_string()))?;

        tokio::time::timeout(timeout, handler.handle(request))
            .await
            .map_err(|_| BusError::Timeout(addr.to_string(), timeout))
    }
}

/// Messages kept in the publish log before the oldest are dropped
pub const DEFAULT_PUBLISH_LOG: usize = 4096;

/// In-memory fan-out bus
///
/// Keeps a bounded log of published messages so tests can inspect what a
/// cluster sent. Meant for tests and single-process clusters; production
/// nodes publish through the broker.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<FanOutMessage>,
    published: Arc<Mutex<VecDeque<FanOutMessage>>>,
    log_capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_PUBLISH_LOG)
    }

    /// Bus whose publish log holds at most `capacity` messages
    pub fn with_log_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self {
            tx,
            published: Arc::new(Mutex::new(VecDeque::new())),
            log_capacity: capacity,
        }
    }

    /// Logged messages, oldest first
    pub fn published(&self) -> Vec<FanOutMessage> {
        self.published.lock().iter().cloned().collect()
    }

    /// Messages published so far on `topic`
    pub fn published_on(&self, topic: &str) -> Vec<FanOutMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanOut for LocalBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let message = FanOutMessage::new(topic, payload);
        {
            let mut log = self.published.lock();
            if log.len() >= self.log_capacity {
                log.pop_front();
            }
            if self.log_capacity > 0 {
                log.push_back(message.clone());
            }
        }
        // No subscribers is fine
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self, topics: Vec<String>) -> mpsc::Receiver<FanOutMessage> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(1024);
        let filter: HashSet<String> = topics.into_iter().collect();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if !filter.is_empty() && !filter.contains(&message.topic) {
                            continue;
                        }
                        if out_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Local subscriber lagged {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        out_rx
    }
}
