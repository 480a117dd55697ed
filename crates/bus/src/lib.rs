//! Mesh Bus - transports between mesh processes
//!
//! Two delivery paths:
//! - request/reply: one client, exactly one server, bounded by a timeout
//! - fan-out: topic-filtered publish/subscribe reaching every current subscriber
//!
//! Both have a WebSocket implementation and an in-memory one.

pub mod broker;
pub mod error;
pub mod local;
pub mod message;
pub mod reqrep;
pub mod transport;

pub use broker::{Broker, BrokerBus};
pub use error::BusError;
pub use local::{LocalBus, LocalNetwork, DEFAULT_PUBLISH_LOG};
pub use message::{
    unix_now, BrokerFrame, FanOutMessage, PeerEntry, Reply, Request, Status, COORDINATOR_TOPIC,
    REPLICATION_TOPIC,
};
pub use reqrep::{RequestServer, WsRequestChannel};
pub use transport::{FanOut, RequestChannel, RequestHandler};
