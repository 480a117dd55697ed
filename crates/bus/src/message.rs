//! Wire types shared by every mesh process
//!
//! Requests and replies travel over the request/reply channel as JSON text
//! frames. Fan-out traffic is a `(topic, payload)` pair.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Topic carrying coordinator announcements
pub const COORDINATOR_TOPIC: &str = "servers";

/// Topic carrying replication envelopes
pub const REPLICATION_TOPIC: &str = "replication";

/// Outcome marker carried by every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "sucesso")]
    Success,
    #[serde(rename = "erro")]
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "sucesso",
            Status::Error => "erro",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request sent to exactly one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Declared operation kind, resolved by the receiver
    pub service: String,
    /// Operation payload
    #[serde(default)]
    pub data: Value,
    /// Sender's logical clock after ticking
    #[serde(default)]
    pub clock: u64,
}

impl Request {
    pub fn new(service: impl Into<String>, data: Value) -> Self {
        Self {
            service: service.into(),
            data,
            clock: 0,
        }
    }

    /// Stamp the request with the sender's clock value
    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }
}

/// The reply to a [`Request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub service: String,
    pub status: Status,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub clock: u64,
}

impl Reply {
    /// Successful reply. `data` is extended with the wall-clock timestamp.
    pub fn success(service: impl Into<String>, data: Value) -> Self {
        Self {
            service: service.into(),
            status: Status::Success,
            data: with_timestamp(data),
            clock: 0,
        }
    }

    /// Error reply carrying a human readable description
    pub fn error(service: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: Status::Error,
            data: with_timestamp(json!({ "description": description.into() })),
            clock: 0,
        }
    }

    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Error description, if this is an error reply
    pub fn description(&self) -> Option<&str> {
        self.data.get("description").and_then(Value::as_str)
    }
}

/// A message delivered through the fan-out channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutMessage {
    pub topic: String,
    pub payload: Value,
}

impl FanOutMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// One node as listed by the rank authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub rank: u64,
    /// Request/reply endpoint the node registered with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

/// Frames exchanged with the fan-out broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Add topics to this connection's filter. An empty list subscribes to everything.
    Subscribe { topics: Vec<String> },
    /// Publish a message to every subscriber of `topic`
    Publish { topic: String, payload: Value },
}

/// Current wall-clock time as fractional unix seconds
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn with_timestamp(data: Value) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.entry("timestamp").or_insert_with(|| json!(unix_now()));
    Value::Object(map)
}
