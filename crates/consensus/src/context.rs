//! Node context - the process-wide mutable state shared by every component

use crate::{
    clock::LogicalClock,
    types::{ElectionState, NodeConfig, PeerInfo},
};
use mesh_bus::{BusError, Reply, Request, RequestChannel};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

/// Point-in-time view of the node, for logs and status replies
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub rank: Option<u64>,
    pub coordinator: Option<String>,
    pub clock: u64,
    pub offset: Option<f64>,
    pub peers: usize,
}

/// Shared node state. Each field has its own lock.
pub struct NodeContext {
    config: NodeConfig,
    clock: LogicalClock,
    rank: RwLock<Option<u64>>,
    coordinator: RwLock<Option<String>>,
    peers: RwLock<Vec<PeerInfo>>,
    /// Last offset measured against the coordinator, in seconds
    offset: RwLock<Option<f64>>,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            clock: LogicalClock::new(),
            rank: RwLock::new(None),
            coordinator: RwLock::new(None),
            peers: RwLock::new(Vec::new()),
            offset: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn rank(&self) -> Option<u64> {
        *self.rank.read()
    }

    pub fn set_rank(&self, rank: u64) {
        *self.rank.write() = Some(rank);
    }

    pub fn coordinator(&self) -> Option<String> {
        self.coordinator.read().clone()
    }

    /// Overwrite the coordinator pointer, returning the previous value
    pub fn set_coordinator(&self, coordinator: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.coordinator.write(), coordinator)
    }

    /// Clear the pointer only if it still names `expected`
    pub fn clear_coordinator_if(&self, expected: &str) -> bool {
        let mut coordinator = self.coordinator.write();
        if coordinator.as_deref() == Some(expected) {
            *coordinator = None;
            true
        } else {
            false
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.read().as_deref() == Some(self.name())
    }

    pub fn election_state(&self) -> ElectionState {
        if self.rank().is_none() {
            return ElectionState::NoRank;
        }
        match self.coordinator() {
            None => ElectionState::NoCoordinator,
            Some(name) if name == self.name() => ElectionState::Coordinator,
            Some(name) => ElectionState::Following(name),
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }

    pub fn set_peers(&self, peers: Vec<PeerInfo>) {
        *self.peers.write() = peers;
    }

    pub fn peer(&self, name: &str) -> Option<PeerInfo> {
        self.peers.read().iter().find(|p| p.name == name).cloned()
    }

    pub fn offset(&self) -> Option<f64> {
        *self.offset.read()
    }

    pub fn set_offset(&self, offset: f64) {
        *self.offset.write() = Some(offset);
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            name: self.config.name.clone(),
            rank: self.rank(),
            coordinator: self.coordinator(),
            clock: self.clock.current(),
            offset: self.offset(),
            peers: self.peers.read().len(),
        }
    }

    /// Send a clock-stamped request and merge the reply's clock.
    ///
    /// Ticks before encoding and observes right after the reply arrives.
    pub async fn request(
        &self,
        channel: &dyn RequestChannel,
        addr: &str,
        service: &str,
        data: Value,
    ) -> Result<Reply, BusError> {
        let request = Request::new(service, data).with_clock(self.clock.tick());
        let reply = channel
            .request(addr, request, self.config.request_timeout)
            .await?;
        self.clock.observe(reply.clock);
        Ok(reply)
    }
}
