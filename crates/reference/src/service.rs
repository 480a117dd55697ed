//! Rank authority service
//!
//! Ranks are handed out sequentially starting at 1. A name that registers
//! again keeps its rank. Nodes that stop sending heartbeats drop out of the
//! list after the heartbeat timeout and are evicted by the cleanup loop.

use async_trait::async_trait;
use mesh_bus::{PeerEntry, Reply, Request, RequestHandler};
use mesh_consensus::{LogicalClock, SERVICE_HEARTBEAT, SERVICE_LIST, SERVICE_RANK};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Default time a node stays listed without a heartbeat
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default period of the eviction sweep
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Registration {
    rank: u64,
    addr: Option<String>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    nodes: HashMap<String, Registration>,
    next_rank: u64,
}

pub struct ReferenceService {
    registry: RwLock<Registry>,
    clock: LogicalClock,
    heartbeat_timeout: Duration,
}

impl ReferenceService {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn with_timeout(heartbeat_timeout: Duration) -> Self {
        Self {
            registry: RwLock::new(Registry {
                nodes: HashMap::new(),
                next_rank: 1,
            }),
            clock: LogicalClock::new(),
            heartbeat_timeout,
        }
    }

    /// Assign (or return the existing) rank for `name`
    pub fn register(&self, name: &str, addr: Option<String>) -> u64 {
        let mut registry = self.registry.write();
        let now = Instant::now();

        if let Some(existing) = registry.nodes.get_mut(name) {
            existing.last_seen = now;
            if addr.is_some() {
                existing.addr = addr;
            }
            return existing.rank;
        }

        let rank = registry.next_rank;
        registry.next_rank += 1;
        registry.nodes.insert(
            name.to_string(),
            Registration {
                rank,
                addr,
                last_seen: now,
            },
        );
        tracing::info!("Registered {} with rank {}", name, rank);
        rank
    }

    /// Nodes seen within the heartbeat timeout, ordered by rank
    pub fn live_nodes(&self) -> Vec<PeerEntry> {
        let registry = self.registry.read();
        let now = Instant::now();
        let mut nodes: Vec<PeerEntry> = registry
            .nodes
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_seen) <= self.heartbeat_timeout)
            .map(|(name, info)| PeerEntry {
                name: name.clone(),
                rank: info.rank,
                addr: info.addr.clone(),
            })
            .collect();
        nodes.sort_by_key(|entry| entry.rank);
        nodes
    }

    /// Refresh liveness. Returns false for unknown names.
    pub fn touch(&self, name: &str) -> bool {
        match self.registry.write().nodes.get_mut(name) {
            Some(info) => {
                info.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop every node silent for longer than the heartbeat timeout
    pub fn evict_stale(&self) -> usize {
        let mut registry = self.registry.write();
        let now = Instant::now();
        let timeout = self.heartbeat_timeout;
        let before = registry.nodes.len();
        registry.nodes.retain(|name, info| {
            let silent = now.duration_since(info.last_seen);
            let keep = silent <= timeout;
            if !keep {
                tracing::info!("Evicting inactive node {} (silent for {:?})", name, silent);
            }
            keep
        });
        before - registry.nodes.len()
    }

    /// Evict stale nodes forever on `interval`
    pub async fn run_cleanup(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.evict_stale();
        }
    }

    fn handle_rank(&self, data: &Value) -> Reply {
        let Some(user) = user_field(data) else {
            return Reply::error(SERVICE_RANK, "missing or invalid field 'user'");
        };
        let addr = data.get("addr").and_then(Value::as_str).map(str::to_string);
        let rank = self.register(user, addr);
        Reply::success(SERVICE_RANK, json!({ "rank": rank }))
    }

    fn handle_list(&self) -> Reply {
        let nodes = self.live_nodes();
        tracing::debug!("Peer list requested: {} live", nodes.len());
        Reply::success(SERVICE_LIST, json!({ "list": nodes }))
    }

    fn handle_heartbeat(&self, data: &Value) -> Reply {
        let Some(user) = user_field(data) else {
            return Reply::error(SERVICE_HEARTBEAT, "missing or invalid field 'user'");
        };
        if self.touch(user) {
            tracing::trace!("Heartbeat from {}", user);
        } else {
            tracing::warn!("Heartbeat from unregistered node {}", user);
        }
        Reply::success(SERVICE_HEARTBEAT, json!({}))
    }
}

impl Default for ReferenceService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestHandler for ReferenceService {
    async fn handle(&self, request: Request) -> Reply {
        self.clock.observe(request.clock);

        let reply = match request.service.as_str() {
            SERVICE_RANK => self.handle_rank(&request.data),
            SERVICE_LIST => self.handle_list(),
            SERVICE_HEARTBEAT => self.handle_heartbeat(&request.data),
            other => {
                tracing::warn!("Unknown service requested: {}", other);
                Reply::error("error", format!("unknown service: {}", other))
            }
        };
        reply.with_clock(self.clock.tick())
    }
}

fn user_field(data: &Value) -> Option<&str> {
    data.get("user")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
}
