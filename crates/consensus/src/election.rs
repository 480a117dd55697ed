//! Rank-based coordinator election
//!
//! Lower rank means higher priority. A node with no higher-priority live
//! peer elects itself and announces it on the coordinator topic; otherwise it
//! asks the higher peers in priority order and defers to the first that
//! answers. Announcements overwrite the coordinator pointer unconditionally.

use crate::{
    context::NodeContext,
    membership::MembershipClient,
    types::{compare_priority, CoordinatorAnnouncement, ElectionOutcome, ElectionReply, SERVICE_ELECTION},
};
use mesh_bus::{FanOut, RequestChannel, COORDINATOR_TOPIC};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

pub struct Election {
    ctx: Arc<NodeContext>,
    membership: MembershipClient,
    channel: Arc<dyn RequestChannel>,
    bus: Arc<dyn FanOut>,
    /// Serializes rounds triggered by different tasks
    round: Mutex<()>,
    wake: Notify,
}

impl Election {
    pub fn new(
        ctx: Arc<NodeContext>,
        membership: MembershipClient,
        channel: Arc<dyn RequestChannel>,
        bus: Arc<dyn FanOut>,
    ) -> Self {
        Self {
            ctx,
            membership,
            channel,
            bus,
            round: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Block until the authority has assigned a rank
    pub async fn ensure_rank(&self) -> u64 {
        loop {
            if let Some(rank) = self.ctx.rank() {
                return rank;
            }
            if let Some(rank) = self.membership.fetch_rank().await {
                return rank;
            }
            tokio::time::sleep(self.ctx.config().rank_retry_interval).await;
        }
    }

    /// Run one election round
    pub async fn run_election(&self) -> ElectionOutcome {
        let _round = self.round.lock().await;

        let Some(rank) = self.ctx.rank() else {
            return ElectionOutcome::NotRanked;
        };
        let name = self.ctx.name().to_string();

        let peers = self.membership.list_peers().await;
        if peers.is_empty() {
            tracing::debug!("Election skipped: peer list unavailable");
            return ElectionOutcome::NoPeers;
        }

        let mut higher: Vec<_> = peers
            .into_iter()
            .filter(|p| p.name != name && p.outranks(rank, &name))
            .collect();
        higher.sort_by(|a, b| compare_priority((a.rank, a.name.as_str()), (b.rank, b.name.as_str())));

        if higher.is_empty() {
            self.announce_self().await;
            return ElectionOutcome::Elected;
        }

        for peer in &higher {
            let reply = match self
                .ctx
                .request(self.channel.as_ref(), &peer.addr, SERVICE_ELECTION, json!({}))
                .await
            {
                Ok(reply) if reply.is_success() => reply,
                Ok(reply) => {
                    tracing::debug!("Election request to {} refused: {:?}", peer.name, reply.description());
                    continue;
                }
                Err(e) => {
                    tracing::debug!("Election request to {} failed: {}", peer.name, e);
                    continue;
                }
            };

            if let Ok(answer) = serde_json::from_value::<ElectionReply>(reply.data) {
                if let Some(coordinator) = answer.coordinator {
                    if self.ctx.coordinator().is_none() {
                        tracing::info!("Adopting coordinator {} reported by {}", coordinator, peer.name);
                        self.ctx.set_coordinator(Some(coordinator));
                    }
                }
            }
            tracing::info!("Deferring to higher-priority peer {} (rank {})", peer.name, peer.rank);
            return ElectionOutcome::Deferred(peer.name.clone());
        }

        tracing::warn!(
            "No higher-priority peer answered ({} asked), staying without coordinator",
            higher.len()
        );
        ElectionOutcome::NoCandidate
    }

    /// Apply an announcement received over fan-out. Last one wins.
    pub fn handle_announcement(&self, announcement: &CoordinatorAnnouncement) {
        self.ctx.clock().observe(announcement.clock);
        let previous = self.ctx.set_coordinator(Some(announcement.coordinator.clone()));
        if previous.as_deref() != Some(announcement.coordinator.as_str()) {
            tracing::info!("New coordinator: {}", announcement.coordinator);
        }
    }

    /// Wake the election loop early; performs no I/O
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Obtain a rank, then retry elections while no coordinator is known
    pub async fn run(&self) {
        self.ensure_rank().await;
        let mut interval = tokio::time::interval(self.ctx.config().election_interval);
        loop {
            if self.ctx.coordinator().is_none() {
                let outcome = self.run_election().await;
                tracing::debug!("Election round: {:?}", outcome);
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn announce_self(&self) {
        let name = self.ctx.name().to_string();
        self.ctx.set_coordinator(Some(name.clone()));

        let announcement = CoordinatorAnnouncement::new(name, self.ctx.clock().tick());
        tracing::info!("{} elected coordinator (clock {})", announcement.coordinator, announcement.clock);
        if let Err(e) = self.bus.publish(COORDINATOR_TOPIC, announcement.to_payload()).await {
            tracing::warn!("Failed to publish coordinator announcement: {}", e);
        }
    }
}
