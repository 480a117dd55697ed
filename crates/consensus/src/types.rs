//! Core types for membership, election and clock sync

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{cmp::Ordering, time::Duration, time::Instant};

/// Rank authority: assign a rank to the requesting node
pub const SERVICE_RANK: &str = "rank";
/// Rank authority: list live nodes
pub const SERVICE_LIST: &str = "list";
/// Rank authority: liveness signal
pub const SERVICE_HEARTBEAT: &str = "heartbeat";
/// Any node: report current time
pub const SERVICE_CLOCK: &str = "clock";
/// Any node: election liveness check, also the announcement kind
pub const SERVICE_ELECTION: &str = "election";

/// Configuration for a mesh node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique, stable node name
    pub name: String,
    /// Request/reply endpoint advertised to peers
    pub addr: String,
    /// Rank authority endpoint
    pub reference_addr: String,
    /// Port assumed for peers that registered without an address
    pub default_port: u16,
    pub heartbeat_interval: Duration,
    /// Election retry period while no coordinator is known
    pub election_interval: Duration,
    pub sync_interval: Duration,
    /// Delay between failed rank requests
    pub rank_retry_interval: Duration,
    /// Bound for every outbound request
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            addr: "127.0.0.1:5555".to_string(),
            reference_addr: "127.0.0.1:5559".to_string(),
            default_port: 5555,
            heartbeat_interval: Duration::from_secs(5),
            election_interval: Duration::from_secs(5),
            sync_interval: Duration::from_secs(30),
            rank_retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_millis(2000),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn reference_addr(mut self, addr: impl Into<String>) -> Self {
        self.reference_addr = addr.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn election_interval(mut self, interval: Duration) -> Self {
        self.election_interval = interval;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn rank_retry_interval(mut self, interval: Duration) -> Self {
        self.rank_retry_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A peer as last reported by the rank authority
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub name: String,
    pub rank: u64,
    pub addr: String,
    /// When this entry was refreshed from the authority
    pub last_seen: Instant,
}

impl PeerInfo {
    /// Whether this peer has priority over a node with `rank` and `name`.
    /// Lower rank wins; equal ranks fall back to name order.
    pub fn outranks(&self, rank: u64, name: &str) -> bool {
        compare_priority((self.rank, self.name.as_str()), (rank, name)) == Ordering::Less
    }
}

/// Total order on (rank, name); `Less` means higher priority
pub fn compare_priority(a: (u64, &str), b: (u64, &str)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// Where the node stands in the election state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    /// Rank not yet assigned by the authority
    NoRank,
    /// Ranked, but no coordinator known
    NoCoordinator,
    /// This node is the coordinator
    Coordinator,
    /// Another node is the coordinator
    Following(String),
}

/// Result of one election round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Rank unknown, nothing attempted
    NotRanked,
    /// Authority returned no peers; cannot decide this round
    NoPeers,
    /// No higher-priority peer exists; this node announced itself
    Elected,
    /// A higher-priority peer answered and is expected to announce itself
    Deferred(String),
    /// Higher-priority peers exist but none answered
    NoCandidate,
}

/// Coordinator announcement published on the coordinator topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorAnnouncement {
    pub coordinator: String,
    pub clock: u64,
    #[serde(default)]
    pub timestamp: f64,
}

impl CoordinatorAnnouncement {
    pub fn new(coordinator: impl Into<String>, clock: u64) -> Self {
        Self {
            coordinator: coordinator.into(),
            clock,
            timestamp: mesh_bus::unix_now(),
        }
    }

    /// Fan-out payload: `{service: "election", data: {...}}`
    pub fn to_payload(&self) -> Value {
        json!({ "service": SERVICE_ELECTION, "data": self })
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        serde_json::from_value(data)
    }
}

/// Reply payload of an election request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionReply {
    pub alive: bool,
    pub rank: Option<u64>,
    pub name: String,
    /// Coordinator known to the replying node, adopted by late joiners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<String>,
}

/// Result of one clock sync round
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// No coordinator known, or this node is the coordinator
    Skipped,
    /// Offset in seconds: coordinator time minus local time
    Synced { coordinator: String, offset: f64 },
    /// Coordinator unreachable; election re-triggered
    Failed { coordinator: String },
}
