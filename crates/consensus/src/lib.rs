//! Mesh Consensus - coordination layer of a mesh node
//!
//! Architecture:
//! - A Lamport clock stamps every send and merges every receive
//! - Ranks come from an external authority; the lowest live rank coordinates
//! - Followers periodically measure their offset to the coordinator
//! - Committed mutations fan out to every peer and apply idempotently

pub mod clock;
pub mod clock_sync;
pub mod context;
pub mod election;
pub mod listener;
pub mod membership;
pub mod replication;
pub mod types;

pub use clock::LogicalClock;
pub use clock_sync::ClockSync;
pub use context::{NodeContext, NodeSnapshot};
pub use election::Election;
pub use listener::FanOutListener;
pub use membership::MembershipClient;
pub use replication::{ApplyOutcome, ReplicationEnvelope, ReplicationStats, Replicator};
pub use types::*;
