//! Cluster Integration Tests
//!
//! Runs whole clusters in one process on the in-memory network and bus:
//! - Client operations end to end through the dispatcher
//! - Replication between nodes, including duplicates
//! - Concurrent elections converging on the lowest rank
//! - Clock sync and failover after the coordinator disappears
//! - Background loops: heartbeats, periodic and nudged elections
//! - State and clock surviving a restart

use std::{sync::Arc, time::Duration};

use mesh_bus::{LocalBus, LocalNetwork, Reply, Request, RequestChannel, COORDINATOR_TOPIC, REPLICATION_TOPIC};
use mesh_consensus::{ApplyOutcome, ElectionOutcome, NodeConfig, ReplicationEnvelope, SyncOutcome};
use mesh_reference::ReferenceService;
use mesh_store::Mutation;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::node::{MeshNode, NodeBuilder};

const AUTHORITY: &str = "reference";

struct Cluster {
    network: LocalNetwork,
    bus: LocalBus,
    authority: Arc<ReferenceService>,
    nodes: Vec<MeshNode>,
    tasks: Vec<JoinHandle<()>>,
    client_clock: u64,
}

impl Cluster {
    fn new() -> Self {
        Self::with_authority(ReferenceService::new())
    }

    fn with_authority(authority: ReferenceService) -> Self {
        let network = LocalNetwork::new();
        let authority = Arc::new(authority);
        network.register(AUTHORITY, authority.clone());
        Self {
            network,
            bus: LocalBus::new(),
            authority,
            nodes: Vec::new(),
            tasks: Vec::new(),
            client_clock: 0,
        }
    }

    fn config(name: &str) -> NodeConfig {
        NodeConfig::new(name, name)
            .reference_addr(AUTHORITY)
            .request_timeout(Duration::from_millis(500))
            .rank_retry_interval(Duration::from_millis(20))
    }

    /// Build a node, make it reachable and start its fan-out listener
    fn add_node(&mut self, name: &str) -> usize {
        self.add_node_with(Self::config(name))
    }

    fn add_node_with(&mut self, config: NodeConfig) -> usize {
        let name = config.name.clone();
        let node = NodeBuilder::new(config)
            .channel(Arc::new(self.network.clone()))
            .bus(Arc::new(self.bus.clone()))
            .build()
            .unwrap();
        self.network.register(name, node.dispatcher());
        self.tasks.push(node.start_listener());
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn node(&self, name: &str) -> &MeshNode {
        self.nodes.iter().find(|n| n.ctx().name() == name).unwrap()
    }

    /// Client request with a Lamport clock of its own
    async fn call(&mut self, addr: &str, service: &str, data: Value) -> Reply {
        self.client_clock += 1;
        let request = Request::new(service, data).with_clock(self.client_clock);
        let reply = self
            .network
            .request(addr, request, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.clock > self.client_clock, "reply clock must follow request clock");
        self.client_clock = self.client_clock.max(reply.clock) + 1;
        reply
    }

    /// Rank the nodes in insertion order, then elect concurrently
    async fn elect_all(&self) {
        for node in &self.nodes {
            node.election().ensure_rank().await;
        }
        let rounds = self.nodes.iter().map(|node| {
            let election = node.election().clone();
            async move { election.run_election().await }
        });
        join_spawned(rounds).await;
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `check` until it holds or two seconds pass
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn join_spawned<F>(futures: impl IntoIterator<Item = F>) -> Vec<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    // Spawned so the rounds really run concurrently on the runtime
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.await.unwrap());
    }
    outputs
}

#[tokio::test]
async fn test_login_channel_publish_history() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");

    let login = cluster.call("a", "login", json!({ "user": "alice" })).await;
    assert!(login.is_success());
    assert_eq!(login.service, "login");
    assert!(login.data.get("timestamp").is_some());

    let channel = cluster.call("a", "channel", json!({ "channel": "geral" })).await;
    assert!(channel.is_success());

    let publish = cluster
        .call("a", "publish", json!({ "user": "alice", "channel": "geral", "message": "hi" }))
        .await;
    assert!(publish.is_success());

    let history = cluster.call("a", "history", json!({ "channel": "geral" })).await;
    assert!(history.is_success());
    let messages = history.data["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["user"], "alice");
    assert_eq!(messages[0]["message"], "hi");

    // The publish also reached the channel's subscribers
    let notifications = cluster.bus.published_on("geral");
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].payload["message"], "hi");

    let users = cluster.call("a", "users", json!({})).await;
    assert_eq!(users.data["users"], json!(["alice"]));
    let channels = cluster.call("a", "channels", json!({})).await;
    assert_eq!(channels.data["channels"], json!(["geral"]));
}

#[tokio::test]
async fn test_duplicate_channel_rejected_locally_and_idempotent_remotely() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.add_node("b");

    assert!(cluster.call("a", "channel", json!({ "channel": "geral" })).await.is_success());
    let again = cluster.call("a", "channel", json!({ "channel": "geral" })).await;
    assert!(!again.is_success());
    assert!(again.description().unwrap().contains("geral"));

    // Only the first commit was propagated
    assert_eq!(cluster.bus.published_on(REPLICATION_TOPIC).len(), 1);

    let b = cluster.node("b");
    assert!(wait_until(|| b.store().read(|s| s.has_channel("geral"))).await);

    // Redelivery of the same envelope changes nothing
    let envelope: ReplicationEnvelope =
        serde_json::from_value(cluster.bus.published_on(REPLICATION_TOPIC)[0].payload.clone()).unwrap();
    assert_eq!(b.replicator().apply(&envelope), ApplyOutcome::Duplicate);
    assert_eq!(b.store().read(|s| s.channels.len()), 1);

    // The origin ignores its own echo
    assert_eq!(cluster.node("a").replicator().apply(&envelope), ApplyOutcome::Echo);
}

#[tokio::test]
async fn test_replicated_messages_match_on_every_node() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.add_node("b");

    cluster.call("a", "login", json!({ "user": "alice" })).await;
    cluster.call("a", "channel", json!({ "channel": "geral" })).await;
    cluster
        .call("a", "publish", json!({ "user": "alice", "channel": "geral", "message": "hi", "timestamp": 1.0 }))
        .await;

    let b = cluster.node("b");
    assert!(wait_until(|| b.store().read(|s| s.messages.len() == 1)).await);

    // A client of "b" sees the message published on "a"
    let history = cluster.call("b", "history", json!({ "channel": "geral" })).await;
    assert!(history.is_success());
    assert_eq!(history.data["messages"][0]["message"], "hi");
    assert_eq!(
        cluster.node("a").store().snapshot(),
        cluster.node("b").store().snapshot()
    );
}

#[tokio::test]
async fn test_invalid_operations_do_not_mutate_or_propagate() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.call("a", "login", json!({ "user": "alice" })).await;
    let propagated = cluster.bus.published_on(REPLICATION_TOPIC).len();

    let subscribe = cluster
        .call("a", "subscribe", json!({ "user": "alice", "channel": "nowhere" }))
        .await;
    assert!(!subscribe.is_success());
    assert!(cluster.node("a").store().read(|s| s.subscriptions.is_empty()));

    cluster.call("a", "channel", json!({ "channel": "geral" })).await;
    let propagated = propagated + 1;

    let publish = cluster
        .call("a", "publish", json!({ "user": "mallory", "channel": "geral", "message": "x" }))
        .await;
    assert!(!publish.is_success());
    assert!(cluster.node("a").store().read(|s| s.messages.is_empty()));
    assert_eq!(cluster.bus.published_on(REPLICATION_TOPIC).len(), propagated);
    assert!(cluster.bus.published_on("geral").is_empty());

    let unknown = cluster.call("a", "teleport", json!({})).await;
    assert!(!unknown.is_success());
    assert!(unknown.description().unwrap().contains("teleport"));
}

#[tokio::test]
async fn test_repeat_subscribe_is_a_noop_success() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.call("a", "login", json!({ "user": "alice" })).await;
    cluster.call("a", "channel", json!({ "channel": "geral" })).await;

    let data = json!({ "user": "alice", "channel": "geral" });
    assert!(cluster.call("a", "subscribe", data.clone()).await.is_success());
    let propagated = cluster.bus.published_on(REPLICATION_TOPIC).len();
    assert!(cluster.call("a", "subscribe", data).await.is_success());

    assert_eq!(cluster.node("a").store().read(|s| s.subscriptions.len()), 1);
    assert_eq!(cluster.bus.published_on(REPLICATION_TOPIC).len(), propagated);
}

#[tokio::test]
async fn test_concurrent_election_converges_on_lowest_rank() {
    let mut cluster = Cluster::new();
    // Pre-register so the ranks are b=1, c=2, a=3
    cluster.authority.register("b", Some("b".to_string()));
    cluster.authority.register("c", Some("c".to_string()));
    cluster.authority.register("a", Some("a".to_string()));
    cluster.add_node("a");
    cluster.add_node("b");
    cluster.add_node("c");

    let rounds = cluster.nodes.iter().map(|node| {
        let election = node.election().clone();
        async move {
            election.ensure_rank().await;
            election.run_election().await
        }
    });
    let outcomes = join_spawned(rounds).await;
    assert!(outcomes.contains(&ElectionOutcome::Elected));

    let converged = wait_until(|| {
        cluster
            .nodes
            .iter()
            .all(|n| n.ctx().coordinator().as_deref() == Some("b"))
    })
    .await;
    assert!(converged);
    assert_eq!(cluster.node("a").ctx().rank(), Some(3));
    assert_eq!(cluster.bus.published_on(COORDINATOR_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_followers_sync_against_coordinator() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.add_node("b");
    cluster.elect_all().await;

    let b = cluster.node("b");
    assert!(wait_until(|| b.ctx().coordinator().as_deref() == Some("a")).await);

    match b.clock_sync().sync_once().await {
        SyncOutcome::Synced { coordinator, offset } => {
            assert_eq!(coordinator, "a");
            assert!(offset.abs() < 1.0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(cluster.node("a").clock_sync().sync_once().await, SyncOutcome::Skipped);
}

#[tokio::test]
async fn test_failover_after_coordinator_disappears() {
    let mut cluster = Cluster::with_authority(ReferenceService::with_timeout(Duration::from_millis(300)));
    cluster.add_node("a");
    cluster.add_node("b");
    cluster.add_node("c");
    cluster.elect_all().await;

    assert!(
        wait_until(|| cluster
            .nodes
            .iter()
            .all(|n| n.ctx().coordinator().as_deref() == Some("a")))
        .await
    );

    // "a" crashes: unreachable, and stops sending heartbeats
    cluster.network.unregister("a");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cluster.authority.touch("b"));
    assert!(cluster.authority.touch("c"));

    let outcome = cluster.node("b").clock_sync().sync_once().await;
    assert_eq!(outcome, SyncOutcome::Failed { coordinator: "a".to_string() });
    assert!(cluster.node("b").ctx().is_coordinator());

    let c = cluster.node("c");
    assert!(wait_until(|| c.ctx().coordinator().as_deref() == Some("b")).await);
}

#[tokio::test]
async fn test_election_and_clock_services() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.add_node("b");
    cluster.elect_all().await;

    let reply = cluster.call("a", "election", json!({})).await;
    assert!(reply.is_success());
    assert_eq!(reply.data["alive"], true);
    assert_eq!(reply.data["name"], "a");
    assert_eq!(reply.data["rank"], 1);

    let clock = cluster.call("b", "clock", json!({})).await;
    assert!(clock.data["time"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_state_and_clock_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let network = LocalNetwork::new();
    let bus = LocalBus::new();

    let build = || {
        NodeBuilder::new(Cluster::config("a"))
            .data_dir(dir.path())
            .channel(Arc::new(network.clone()))
            .bus(Arc::new(bus.clone()))
            .build()
            .unwrap()
    };

    let clock_before = {
        let node = build();
        network.register("a", node.dispatcher());
        let reply = network
            .request(
                "a",
                Request::new("login", json!({ "user": "alice" })).with_clock(7),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(reply.is_success());

        let metadata = node.save().unwrap().unwrap();
        assert_eq!(metadata.users, 1);
        network.unregister("a");
        node.ctx().clock().current()
    };

    let node = build();
    assert!(node.store().read(|s| s.has_user("alice")));
    assert!(node.ctx().clock().current() >= clock_before);
}

#[tokio::test]
async fn test_replication_envelope_carries_mutation_and_origin() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.call("a", "login", json!({ "user": "alice" })).await;

    let published = cluster.bus.published_on(REPLICATION_TOPIC);
    let envelope: ReplicationEnvelope = serde_json::from_value(published[0].payload.clone()).unwrap();
    assert_eq!(envelope.origin, "a");
    assert_eq!(envelope.mutation, Mutation::Login { user: "alice".to_string() });
    assert!(envelope.clock > 0);
}

#[tokio::test]
async fn test_notification_clock_follows_replication_clock() {
    let mut cluster = Cluster::new();
    cluster.add_node("a");
    cluster.call("a", "login", json!({ "user": "alice" })).await;
    cluster.call("a", "channel", json!({ "channel": "geral" })).await;

    let publish = cluster
        .call("a", "publish", json!({ "user": "alice", "channel": "geral", "message": "hi" }))
        .await;
    assert!(publish.is_success());

    let envelopes = cluster.bus.published_on(REPLICATION_TOPIC);
    let envelope: ReplicationEnvelope =
        serde_json::from_value(envelopes.last().unwrap().payload.clone()).unwrap();
    let notifications = cluster.bus.published_on("geral");
    let notification_clock = notifications[0].payload["clock"].as_u64().unwrap();

    // Each send carries its own tick: replicate, then notify, then reply
    assert!(notification_clock > envelope.clock);
    assert!(publish.clock > notification_clock);
    assert_eq!(notifications[0].payload["message"], "hi");

    // History keeps the clock the message was created with
    let stored = cluster.node("a").store().read(|s| s.messages[0].clock);
    assert!(stored < envelope.clock);
}

#[tokio::test]
async fn test_background_loops_heartbeat_and_retry_election() {
    let mut cluster = Cluster::with_authority(ReferenceService::with_timeout(Duration::from_millis(300)));
    // "z" takes rank 1 and then goes silent
    cluster.authority.register("z", Some("z".to_string()));
    let config = Cluster::config("b")
        .heartbeat_interval(Duration::from_millis(30))
        .election_interval(Duration::from_millis(30));
    cluster.add_node_with(config);
    let tasks = cluster.node("b").start_background();
    cluster.tasks.extend(tasks);

    let b = cluster.node("b");
    assert!(wait_until(|| b.ctx().rank() == Some(2)).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(b.ctx().coordinator().is_none());

    // Heartbeats keep "b" listed while "z" expires, then a periodic round elects "b"
    assert!(wait_until(|| b.ctx().is_coordinator()).await);
    let live: Vec<String> = cluster.authority.live_nodes().into_iter().map(|p| p.name).collect();
    assert_eq!(live, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_election_request_wakes_coordinatorless_node() {
    let mut cluster = Cluster::with_authority(ReferenceService::with_timeout(Duration::from_millis(300)));
    cluster.authority.register("z", Some("z".to_string()));
    let config = Cluster::config("b")
        .heartbeat_interval(Duration::from_millis(30))
        .election_interval(Duration::from_secs(60));
    cluster.add_node_with(config);
    let tasks = cluster.node("b").start_background();
    cluster.tasks.extend(tasks);

    assert!(wait_until(|| cluster.node("b").ctx().rank() == Some(2)).await);
    // Long after "z" expired, no periodic round has run again
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(cluster.node("b").ctx().coordinator().is_none());

    let reply = cluster.call("b", "election", json!({})).await;
    assert!(reply.is_success());
    assert!(reply.data.get("coordinator").is_none());

    let b = cluster.node("b");
    assert!(wait_until(|| b.ctx().is_coordinator()).await);
    assert_eq!(cluster.bus.published_on(COORDINATOR_TOPIC).len(), 1);
}
