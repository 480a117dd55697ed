//! Membership client - talks to the rank authority

use crate::{
    context::NodeContext,
    types::{PeerInfo, SERVICE_HEARTBEAT, SERVICE_LIST, SERVICE_RANK},
};
use mesh_bus::{PeerEntry, RequestChannel};
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};

/// Client for the rank authority's rank/list/heartbeat services
#[derive(Clone)]
pub struct MembershipClient {
    ctx: Arc<NodeContext>,
    channel: Arc<dyn RequestChannel>,
}

impl MembershipClient {
    pub fn new(ctx: Arc<NodeContext>, channel: Arc<dyn RequestChannel>) -> Self {
        Self { ctx, channel }
    }

    /// Ask the authority for this node's rank. `None` means retry later.
    pub async fn fetch_rank(&self) -> Option<u64> {
        let data = json!({ "user": self.ctx.name(), "addr": self.ctx.config().addr });
        let reply = match self.call(SERVICE_RANK, data).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Rank request failed: {}", e);
                return None;
            }
        };

        match reply.get("rank").and_then(Value::as_u64) {
            Some(rank) => {
                if self.ctx.rank() != Some(rank) {
                    tracing::info!("{} assigned rank {}", self.ctx.name(), rank);
                }
                self.ctx.set_rank(rank);
                Some(rank)
            }
            None => {
                tracing::warn!("Rank reply without a rank: {}", reply);
                None
            }
        }
    }

    /// Fetch the live node list and refresh the peer cache.
    ///
    /// Empty on failure; callers must treat that as "cannot decide".
    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        let reply = match self.call(SERVICE_LIST, json!({})).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Peer list request failed: {}", e);
                return Vec::new();
            }
        };

        let entries: Vec<PeerEntry> = match reply
            .get("list")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Malformed peer list: {}", e);
                return Vec::new();
            }
        };

        let now = Instant::now();
        let default_port = self.ctx.config().default_port;
        let peers: Vec<PeerInfo> = entries
            .into_iter()
            .map(|entry| PeerInfo {
                addr: entry
                    .addr
                    .unwrap_or_else(|| format!("{}:{}", entry.name, default_port)),
                name: entry.name,
                rank: entry.rank,
                last_seen: now,
            })
            .collect();

        if !peers.is_empty() {
            self.ctx.set_peers(peers.clone());
        }
        peers
    }

    /// Fire-and-forget liveness signal
    pub async fn heartbeat(&self) {
        let data = json!({ "user": self.ctx.name() });
        if let Err(e) = self.call(SERVICE_HEARTBEAT, data).await {
            tracing::warn!("Heartbeat failed: {}", e);
        }
    }

    /// Send heartbeats forever on the configured interval
    pub async fn run_heartbeat(&self) {
        let mut interval = tokio::time::interval(self.ctx.config().heartbeat_interval);
        loop {
            interval.tick().await;
            self.heartbeat().await;
        }
    }

    /// One request to the authority; error replies become `Err`
    async fn call(&self, service: &str, data: Value) -> Result<Value, String> {
        let addr = self.ctx.config().reference_addr.clone();
        let reply = self
            .ctx
            .request(self.channel.as_ref(), &addr, service, data)
            .await
            .map_err(|e| e.to_string())?;

        if reply.is_success() {
            Ok(reply.data)
        } else {
            Err(reply
                .description()
                .unwrap_or("authority returned an error")
                .to_string())
        }
    }
}
