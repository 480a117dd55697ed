//! Replicated application state
//!
//! Every mutation goes through [`Mutation`]. Locally originated mutations are
//! validated first; mutations received from peers are applied without
//! validation and are idempotent by value equality.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};

/// A (user, channel) subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user: String,
    pub channel: String,
}

/// A message published to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub user: String,
    pub channel: String,
    pub message: String,
    /// Sender-supplied wall-clock timestamp (unix seconds)
    pub timestamp: f64,
    /// Logical clock of the originating node when the record was created
    pub clock: u64,
}

/// A private message between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub src: String,
    pub dst: String,
    pub message: String,
    pub timestamp: f64,
    pub clock: u64,
}

/// A state-changing operation, carried verbatim inside replication envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", content = "data")]
pub enum Mutation {
    #[serde(rename = "replicate_login")]
    Login { user: String },
    #[serde(rename = "replicate_channel")]
    Channel { channel: String },
    #[serde(rename = "replicate_subscribe")]
    Subscribe(Subscription),
    #[serde(rename = "replicate_publish")]
    Publish(ChannelMessage),
    #[serde(rename = "replicate_message")]
    Message(PrivateMessage),
}

impl Mutation {
    /// Wire name of the replicated operation
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Login { .. } => "replicate_login",
            Mutation::Channel { .. } => "replicate_channel",
            Mutation::Subscribe(_) => "replicate_subscribe",
            Mutation::Publish(_) => "replicate_publish",
            Mutation::Message(_) => "replicate_message",
        }
    }
}

/// The application's mutable store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub users: Vec<String>,
    pub channels: Vec<String>,
    pub subscriptions: Vec<Subscription>,
    pub messages: Vec<ChannelMessage>,
    pub private_messages: Vec<PrivateMessage>,
}

impl ReplicatedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.users.iter().any(|u| u == user)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// Messages published to `channel`, oldest first
    pub fn history(&self, channel: &str) -> Result<Vec<ChannelMessage>, StoreError> {
        if !self.has_channel(channel) {
            return Err(StoreError::UnknownChannel(channel.to_string()));
        }
        Ok(self
            .messages
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect())
    }

    /// Check a locally originated mutation against the current state
    pub fn validate(&self, mutation: &Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::Login { user } => {
                non_empty("user", user)?;
            }
            Mutation::Channel { channel } => {
                non_empty("channel", channel)?;
                if self.has_channel(channel) {
                    return Err(StoreError::ChannelExists(channel.clone()));
                }
            }
            Mutation::Subscribe(sub) => {
                self.require_user(&sub.user)?;
                self.require_channel(&sub.channel)?;
            }
            Mutation::Publish(msg) => {
                self.require_user(&msg.user)?;
                self.require_channel(&msg.channel)?;
            }
            Mutation::Message(msg) => {
                self.require_user(&msg.src)?;
                self.require_user(&msg.dst)?;
            }
        }
        Ok(())
    }

    /// Apply a mutation without validation.
    ///
    /// Returns `false` when the state already contained the record, so
    /// applying the same mutation any number of times yields the same state.
    pub fn apply(&mut self, mutation: &Mutation) -> bool {
        match mutation {
            Mutation::Login { user } => insert_unique(&mut self.users, user),
            Mutation::Channel { channel } => insert_unique(&mut self.channels, channel),
            Mutation::Subscribe(sub) => append_unique(&mut self.subscriptions, sub),
            Mutation::Publish(msg) => append_unique(&mut self.messages, msg),
            Mutation::Message(msg) => append_unique(&mut self.private_messages, msg),
        }
    }

    fn require_user(&self, user: &str) -> Result<(), StoreError> {
        if self.has_user(user) {
            Ok(())
        } else {
            Err(StoreError::UnknownUser(user.to_string()))
        }
    }

    fn require_channel(&self, channel: &str) -> Result<(), StoreError> {
        if self.has_channel(channel) {
            Ok(())
        } else {
            Err(StoreError::UnknownChannel(channel.to_string()))
        }
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        Err(StoreError::EmptyField(field))
    } else {
        Ok(())
    }
}

fn insert_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

// Value-equality scan: the same content fields and the same clock mean the
// same logical record.
fn append_unique<T: PartialEq + Clone>(list: &mut Vec<T>, record: &T) -> bool {
    if list.contains(record) {
        return false;
    }
    list.push(record.clone());
    true
}
