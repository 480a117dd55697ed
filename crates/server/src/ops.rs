//! Operation kinds and their request payloads

use crate::error::ServiceError;
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Every operation a node serves over request/reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Login,
    Users,
    Channel,
    Channels,
    Subscribe,
    Publish,
    Message,
    History,
    Clock,
    Election,
}

impl OpKind {
    pub const ALL: [OpKind; 10] = [
        OpKind::Login,
        OpKind::Users,
        OpKind::Channel,
        OpKind::Channels,
        OpKind::Subscribe,
        OpKind::Publish,
        OpKind::Message,
        OpKind::History,
        OpKind::Clock,
        OpKind::Election,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Login => "login",
            OpKind::Users => "users",
            OpKind::Channel => "channel",
            OpKind::Channels => "channels",
            OpKind::Subscribe => "subscribe",
            OpKind::Publish => "publish",
            OpKind::Message => "message",
            OpKind::History => "history",
            OpKind::Clock => "clock",
            OpKind::Election => "election",
        }
    }
}

impl FromStr for OpKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ServiceError::UnknownService(s.to_string()))
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Payloads ============

#[derive(Debug, Deserialize)]
pub struct LoginData {
    pub user: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelData {
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeData {
    pub user: String,
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishData {
    pub user: String,
    pub channel: String,
    pub message: String,
    /// Client wall-clock time; the server's is used when absent
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct MessageData {
    pub src: String,
    pub dst: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryData {
    pub channel: String,
}
