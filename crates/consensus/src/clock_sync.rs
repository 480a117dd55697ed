//! Berkeley-style clock synchronization against the coordinator
//!
//! Only measures and records the offset; the OS clock is never adjusted.

use crate::{
    context::NodeContext,
    election::Election,
    membership::MembershipClient,
    types::{SyncOutcome, SERVICE_CLOCK},
};
use mesh_bus::{unix_now, RequestChannel};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct ClockSync {
    ctx: Arc<NodeContext>,
    membership: MembershipClient,
    election: Arc<Election>,
    channel: Arc<dyn RequestChannel>,
}

impl ClockSync {
    pub fn new(
        ctx: Arc<NodeContext>,
        membership: MembershipClient,
        election: Arc<Election>,
        channel: Arc<dyn RequestChannel>,
    ) -> Self {
        Self {
            ctx,
            membership,
            election,
            channel,
        }
    }

    /// One sync round
    pub async fn sync_once(&self) -> SyncOutcome {
        let Some(coordinator) = self.ctx.coordinator() else {
            return SyncOutcome::Skipped;
        };
        if coordinator == self.ctx.name() {
            return SyncOutcome::Skipped;
        }

        match self.measure(&coordinator).await {
            Ok(offset) => {
                self.ctx.set_offset(offset);
                tracing::info!("Clock offset to coordinator {}: {:+.3}s", coordinator, offset);
                SyncOutcome::Synced { coordinator, offset }
            }
            Err(e) => {
                tracing::warn!("Clock sync with coordinator {} failed: {}", coordinator, e);
                // An announcement may have replaced the pointer meanwhile
                if self.ctx.clear_coordinator_if(&coordinator) {
                    let outcome = self.election.run_election().await;
                    tracing::info!("Re-election after sync failure: {:?}", outcome);
                }
                SyncOutcome::Failed { coordinator }
            }
        }
    }

    /// Sync forever on the configured interval
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.ctx.config().sync_interval);
        // The first tick fires immediately; give the election a period first
        interval.tick().await;
        loop {
            interval.tick().await;
            self.sync_once().await;
        }
    }

    async fn measure(&self, coordinator: &str) -> Result<f64, String> {
        let addr = self.resolve(coordinator).await?;

        let sent_at = unix_now();
        let reply = self
            .ctx
            .request(self.channel.as_ref(), &addr, SERVICE_CLOCK, json!({}))
            .await
            .map_err(|e| e.to_string())?;
        let received_at = unix_now();

        if !reply.is_success() {
            return Err(reply.description().unwrap_or("error reply").to_string());
        }
        let remote = reply
            .data
            .get("time")
            .and_then(Value::as_f64)
            .ok_or_else(|| "clock reply without time".to_string())?;

        Ok(remote - (sent_at + received_at) / 2.0)
    }

    /// Coordinator address from the peer cache, refreshing it once on a miss
    async fn resolve(&self, coordinator: &str) -> Result<String, String> {
        if let Some(peer) = self.ctx.peer(coordinator) {
            return Ok(peer.addr);
        }
        self.membership
            .list_peers()
            .await
            .into_iter()
            .find(|p| p.name == coordinator)
            .map(|p| p.addr)
            .ok_or_else(|| format!("coordinator {} not in peer list", coordinator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElectionOutcome, NodeConfig};
    use async_trait::async_trait;
    use mesh_bus::{LocalBus, LocalNetwork, Reply, Request, RequestHandler, COORDINATOR_TOPIC};
    use std::time::Duration;

    struct Roster(Vec<(&'static str, u64)>);

    #[async_trait]
    impl RequestHandler for Roster {
        async fn handle(&self, _request: Request) -> Reply {
            let list: Vec<Value> = self
                .0
                .iter()
                .map(|(name, rank)| json!({ "name": name, "rank": rank, "addr": name }))
                .collect();
            Reply::success("list", json!({ "list": list }))
        }
    }

    /// Coordinator whose clock runs ahead by a fixed amount
    struct Ahead(f64);

    #[async_trait]
    impl RequestHandler for Ahead {
        async fn handle(&self, request: Request) -> Reply {
            Reply::success("clock", json!({ "time": unix_now() + self.0 })).with_clock(request.clock)
        }
    }

    fn sync(name: &str, network: &LocalNetwork, bus: &LocalBus) -> (Arc<NodeContext>, ClockSync) {
        sync_with(NodeConfig::new(name, name), network, bus)
    }

    fn sync_with(config: NodeConfig, network: &LocalNetwork, bus: &LocalBus) -> (Arc<NodeContext>, ClockSync) {
        let ctx = Arc::new(NodeContext::new(config.reference_addr("authority")));
        let channel: Arc<dyn RequestChannel> = Arc::new(network.clone());
        let membership = MembershipClient::new(ctx.clone(), channel.clone());
        let election = Arc::new(Election::new(
            ctx.clone(),
            membership.clone(),
            channel.clone(),
            Arc::new(bus.clone()),
        ));
        (ctx.clone(), ClockSync::new(ctx, membership, election, channel))
    }

    #[tokio::test]
    async fn test_skipped_without_coordinator_or_when_coordinator() {
        let network = LocalNetwork::new();
        let bus = LocalBus::new();
        let (ctx, sync) = sync("a", &network, &bus);

        assert_eq!(sync.sync_once().await, SyncOutcome::Skipped);
        ctx.set_coordinator(Some("a".to_string()));
        assert_eq!(sync.sync_once().await, SyncOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_measures_offset_against_coordinator() {
        let network = LocalNetwork::new();
        network.register("authority", Arc::new(Roster(vec![("a", 1), ("b", 2)])));
        network.register("a", Arc::new(Ahead(5.0)));
        let bus = LocalBus::new();
        let (ctx, sync) = sync("b", &network, &bus);
        ctx.set_coordinator(Some("a".to_string()));

        match sync.sync_once().await {
            SyncOutcome::Synced { coordinator, offset } => {
                assert_eq!(coordinator, "a");
                assert!((offset - 5.0).abs() < 0.5, "offset {}", offset);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(ctx.offset().is_some());
    }

    #[tokio::test]
    async fn test_failure_clears_coordinator_and_reelects() {
        let network = LocalNetwork::new();
        // "a" is listed but unreachable; "b" is the only other node
        network.register("authority", Arc::new(Roster(vec![("b", 2)])));
        let bus = LocalBus::new();
        let (ctx, sync) = sync("b", &network, &bus);
        ctx.set_rank(2);
        ctx.set_coordinator(Some("a".to_string()));

        assert_eq!(
            sync.sync_once().await,
            SyncOutcome::Failed { coordinator: "a".to_string() }
        );
        // Nobody outranks "b" anymore, so the re-election picks it
        assert!(ctx.is_coordinator());
        assert_eq!(bus.published_on(COORDINATOR_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_failure_without_authority_leaves_no_coordinator() {
        let network = LocalNetwork::new();
        let bus = LocalBus::new();
        let (ctx, sync) = sync("b", &network, &bus);
        ctx.set_rank(2);
        ctx.set_coordinator(Some("a".to_string()));

        sync.sync_once().await;
        assert!(ctx.coordinator().is_none());
        assert_eq!(sync.election.run_election().await, ElectionOutcome::NoPeers);
    }

    #[tokio::test]
    async fn test_sync_loop_records_offset_after_first_period() {
        let network = LocalNetwork::new();
        network.register("authority", Arc::new(Roster(vec![("a", 1), ("b", 2)])));
        network.register("a", Arc::new(Ahead(-3.0)));
        let bus = LocalBus::new();
        let config = NodeConfig::new("b", "b").sync_interval(Duration::from_millis(20));
        let (ctx, sync) = sync_with(config, &network, &bus);
        ctx.set_coordinator(Some("a".to_string()));

        let sync = Arc::new(sync);
        let task = tokio::spawn({
            let sync = sync.clone();
            async move { sync.run().await }
        });

        let mut offset = None;
        for _ in 0..200 {
            offset = ctx.offset();
            if offset.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        let offset = offset.expect("sync loop should record an offset");
        assert!((offset + 3.0).abs() < 0.5, "offset {}", offset);
    }
}
