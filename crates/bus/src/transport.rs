//! Transport abstractions
//!
//! The node core only talks to the bus through these traits, so the same
//! engine runs on WebSockets in production and on in-memory channels in
//! tests.

use crate::{
    error::BusError,
    message::{FanOutMessage, Reply, Request},
};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Client side of the synchronous request/reply channel
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Send one request to the server at `addr` and wait up to `timeout` for its reply
    async fn request(&self, addr: &str, request: Request, timeout: Duration) -> Result<Reply, BusError>;
}

/// Server side of the request/reply channel
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce a reply for every request. Must never fail.
    async fn handle(&self, request: Request) -> Reply;
}

/// Topic-filtered publish/subscribe channel
#[async_trait]
pub trait FanOut: Send + Sync {
    /// Publish `payload` to every current subscriber of `topic`
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;

    /// Subscribe to `topics`. An empty list receives every topic.
    ///
    /// In-memory buses register before returning; remote buses register as
    /// soon as the broker connection is up and re-register after reconnects.
    fn subscribe(&self, topics: Vec<String>) -> mpsc::Receiver<FanOutMessage>;
}
