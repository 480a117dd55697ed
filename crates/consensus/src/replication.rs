//! Fan-out replication of committed mutations
//!
//! Every committed local mutation is wrapped in a [`ReplicationEnvelope`]
//! and published once on the replication topic. Peers apply it without
//! validation; duplicates and own echoes are no-ops.

use crate::context::NodeContext;
use mesh_bus::{FanOut, REPLICATION_TOPIC};
use mesh_store::{Mutation, StateStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A committed mutation as broadcast to peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub mutation: Mutation,
    /// Name of the node that committed the mutation
    pub origin: String,
    pub clock: u64,
}

/// What happened to a received envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Our own envelope coming back through the bus
    Echo,
    Applied,
    /// Already present locally
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    pub propagated: u64,
    pub publish_failures: u64,
    pub applied: u64,
    pub duplicates: u64,
}

pub struct Replicator {
    ctx: Arc<NodeContext>,
    store: Arc<StateStore>,
    bus: Arc<dyn FanOut>,
    stats: RwLock<ReplicationStats>,
}

impl Replicator {
    pub fn new(ctx: Arc<NodeContext>, store: Arc<StateStore>, bus: Arc<dyn FanOut>) -> Self {
        Self {
            ctx,
            store,
            bus,
            stats: RwLock::new(ReplicationStats::default()),
        }
    }

    /// Publish a committed mutation. Best effort: failures are logged only.
    pub async fn propagate(&self, mutation: Mutation) {
        let envelope = ReplicationEnvelope {
            mutation,
            origin: self.ctx.name().to_string(),
            clock: self.ctx.clock().tick(),
        };

        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode replication envelope: {}", e);
                return;
            }
        };

        match self.bus.publish(REPLICATION_TOPIC, payload).await {
            Ok(()) => {
                self.stats.write().propagated += 1;
                tracing::debug!("Propagated {} (clock {})", envelope.mutation.kind(), envelope.clock);
            }
            Err(e) => {
                self.stats.write().publish_failures += 1;
                tracing::warn!("Failed to propagate {}: {}", envelope.mutation.kind(), e);
            }
        }
    }

    /// Apply an envelope received from the bus
    pub fn apply(&self, envelope: &ReplicationEnvelope) -> ApplyOutcome {
        if envelope.origin == self.ctx.name() {
            return ApplyOutcome::Echo;
        }
        let clock = self.ctx.clock().observe(envelope.clock);

        if self.store.apply_replicated(&envelope.mutation, clock) {
            self.stats.write().applied += 1;
            tracing::debug!(
                "Applied {} from {} (clock {})",
                envelope.mutation.kind(),
                envelope.origin,
                envelope.clock
            );
            ApplyOutcome::Applied
        } else {
            self.stats.write().duplicates += 1;
            ApplyOutcome::Duplicate
        }
    }

    /// Decode and apply a raw fan-out payload
    pub fn apply_payload(&self, payload: Value) -> Option<ApplyOutcome> {
        match serde_json::from_value::<ReplicationEnvelope>(payload) {
            Ok(envelope) => Some(self.apply(&envelope)),
            Err(e) => {
                tracing::warn!("Dropping malformed replication envelope: {}", e);
                None
            }
        }
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.read().clone()
    }
}
