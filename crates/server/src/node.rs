//! Node assembly - wires the coordination engine under the dispatcher

use crate::dispatcher::Dispatcher;
use mesh_bus::{FanOut, RequestChannel, RequestServer, WsRequestChannel};
use mesh_consensus::{ClockSync, Election, FanOutListener, MembershipClient, NodeConfig, NodeContext, Replicator};
use mesh_store::{StateStore, StoreMetadata};
use std::{path::PathBuf, sync::Arc};
use tokio::task::JoinHandle;

/// A fully wired mesh server node
pub struct MeshNode {
    ctx: Arc<NodeContext>,
    store: Arc<StateStore>,
    bus: Arc<dyn FanOut>,
    membership: MembershipClient,
    election: Arc<Election>,
    sync: Arc<ClockSync>,
    replicator: Arc<Replicator>,
    listener: Arc<FanOutListener>,
    dispatcher: Arc<Dispatcher>,
}

impl MeshNode {
    pub fn ctx(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    pub fn clock_sync(&self) -> &Arc<ClockSync> {
        &self.sync
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Subscribe to the coordinator and replication topics and spawn the
    /// fan-out listener. Call before any peer starts publishing.
    pub fn start_listener(&self) -> JoinHandle<()> {
        let rx = FanOutListener::subscribe(self.bus.as_ref());
        let listener = self.listener.clone();
        tokio::spawn(async move { listener.run(rx).await })
    }

    /// Spawn heartbeat, election and clock sync loops
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let membership = self.membership.clone();
        let election = self.election.clone();
        let sync = self.sync.clone();

        vec![
            tokio::spawn(async move { membership.run_heartbeat().await }),
            tokio::spawn(async move { election.run().await }),
            tokio::spawn(async move { sync.run().await }),
        ]
    }

    /// Spawn every background task
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.start_listener()];
        tasks.extend(self.start_background());
        tracing::info!("Node {} started", self.ctx.name());
        tasks
    }

    /// Serve client requests on `addr` until the listener fails
    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        RequestServer::new(self.dispatcher.clone()).run(addr).await
    }

    /// Save state and clock (used on shutdown)
    pub fn save(&self) -> anyhow::Result<Option<StoreMetadata>> {
        Ok(self.store.save(self.ctx.clock().current())?)
    }
}

/// Builder for MeshNode
pub struct NodeBuilder {
    config: NodeConfig,
    data_dir: Option<PathBuf>,
    channel: Option<Arc<dyn RequestChannel>>,
    bus: Option<Arc<dyn FanOut>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            data_dir: None,
            channel: None,
            bus: None,
        }
    }

    /// Persist state under `dir`; in-memory when unset
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Outbound request channel; WebSocket when unset
    pub fn channel(mut self, channel: Arc<dyn RequestChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn FanOut>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> anyhow::Result<MeshNode> {
        let bus = self
            .bus
            .ok_or_else(|| anyhow::anyhow!("a fan-out bus is required"))?;
        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(WsRequestChannel::new()));

        let store = match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                StateStore::open(dir)?
            }
            None => StateStore::in_memory(),
        };
        let store = Arc::new(store);

        let ctx = Arc::new(NodeContext::new(self.config));
        if store.restored_clock() > 0 {
            let clock = ctx.clock().restore(store.restored_clock());
            tracing::info!("Restored logical clock to {}", clock);
        }

        let membership = MembershipClient::new(ctx.clone(), channel.clone());
        let election = Arc::new(Election::new(
            ctx.clone(),
            membership.clone(),
            channel.clone(),
            bus.clone(),
        ));
        let sync = Arc::new(ClockSync::new(
            ctx.clone(),
            membership.clone(),
            election.clone(),
            channel,
        ));
        let replicator = Arc::new(Replicator::new(ctx.clone(), store.clone(), bus.clone()));
        let listener = Arc::new(FanOutListener::new(election.clone(), replicator.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            ctx.clone(),
            store.clone(),
            election.clone(),
            replicator.clone(),
            bus.clone(),
        ));

        Ok(MeshNode {
            ctx,
            store,
            bus,
            membership,
            election,
            sync,
            replicator,
            listener,
            dispatcher,
        })
    }
}
