//! Operation handlers
//!
//! Handlers read and mutate the store and describe side effects in their
//! [`HandlerOutcome`]; the dispatcher performs propagation and fan-out.
//! None of them touch the network.

use crate::{
    error::ServiceError,
    ops::{ChannelData, HistoryData, LoginData, MessageData, OpKind, PublishData, SubscribeData},
};
use mesh_bus::unix_now;
use mesh_consensus::{Election, ElectionReply, NodeContext};
use mesh_store::{ChannelMessage, Mutation, PrivateMessage, StateStore, Subscription};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// What a handler may read and mutate
pub struct HandlerEnv<'a> {
    pub ctx: &'a NodeContext,
    pub store: &'a StateStore,
    pub election: &'a Election,
}

/// Clock and wall time at which the request was received
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    /// Logical clock right after observing the request
    pub clock: u64,
    pub timestamp: f64,
}

/// Result of a successful handler run
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    /// Reply payload
    pub data: Value,
    /// Committed mutation to propagate to peers
    pub mutation: Option<Mutation>,
    /// `(topic, payload)` to publish for subscribers
    pub notification: Option<(String, Value)>,
}

impl HandlerOutcome {
    fn reply(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

pub type Handler = fn(&HandlerEnv<'_>, &Value, Stamp) -> Result<HandlerOutcome, ServiceError>;

/// Handler table
pub fn handler_for(kind: OpKind) -> Handler {
    match kind {
        OpKind::Login => handle_login,
        OpKind::Users => handle_users,
        OpKind::Channel => handle_channel,
        OpKind::Channels => handle_channels,
        OpKind::Subscribe => handle_subscribe,
        OpKind::Publish => handle_publish,
        OpKind::Message => handle_message,
        OpKind::History => handle_history,
        OpKind::Clock => handle_clock,
        OpKind::Election => handle_election,
    }
}

fn parse<T: DeserializeOwned>(data: &Value) -> Result<T, ServiceError> {
    Ok(T::deserialize(data)?)
}

/// Commit `mutation`, keeping it for propagation only if it changed state
fn commit(env: &HandlerEnv<'_>, mutation: Mutation, stamp: Stamp) -> Result<Option<Mutation>, ServiceError> {
    let changed = env.store.commit(&mutation, stamp.clock)?;
    Ok(changed.then_some(mutation))
}

fn handle_login(env: &HandlerEnv<'_>, data: &Value, stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let LoginData { user } = parse(data)?;
    let mutation = commit(env, Mutation::Login { user: user.clone() }, stamp)?;
    if mutation.is_some() {
        tracing::info!("New user {}", user);
    }
    Ok(HandlerOutcome {
        mutation,
        ..HandlerOutcome::reply(json!({}))
    })
}

fn handle_users(env: &HandlerEnv<'_>, _data: &Value, _stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let users = env.store.read(|state| state.users.clone());
    Ok(HandlerOutcome::reply(json!({ "users": users })))
}

fn handle_channel(env: &HandlerEnv<'_>, data: &Value, stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let ChannelData { channel } = parse(data)?;
    let mutation = commit(env, Mutation::Channel { channel }, stamp)?;
    Ok(HandlerOutcome {
        mutation,
        ..HandlerOutcome::reply(json!({}))
    })
}

fn handle_channels(env: &HandlerEnv<'_>, _data: &Value, _stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let channels = env.store.read(|state| state.channels.clone());
    Ok(HandlerOutcome::reply(json!({ "channels": channels })))
}

fn handle_subscribe(env: &HandlerEnv<'_>, data: &Value, stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let SubscribeData { user, channel } = parse(data)?;
    let mutation = commit(env, Mutation::Subscribe(Subscription { user, channel }), stamp)?;
    Ok(HandlerOutcome {
        mutation,
        ..HandlerOutcome::reply(json!({}))
    })
}

fn handle_publish(env: &HandlerEnv<'_>, data: &Value, stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let PublishData {
        user,
        channel,
        message,
        timestamp,
    } = parse(data)?;

    let record = ChannelMessage {
        user,
        channel,
        message,
        timestamp: timestamp.unwrap_or(stamp.timestamp),
        clock: stamp.clock,
    };
    let notification = (record.channel.clone(), serde_json::to_value(&record)?);
    let mutation = commit(env, Mutation::Publish(record), stamp)?;

    Ok(HandlerOutcome {
        notification: mutation.as_ref().map(|_| notification),
        mutation,
        ..HandlerOutcome::reply(json!({}))
    })
}

fn handle_message(env: &HandlerEnv<'_>, data: &Value, stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let MessageData {
        src,
        dst,
        message,
        timestamp,
    } = parse(data)?;

    let record = PrivateMessage {
        src,
        dst,
        message,
        timestamp: timestamp.unwrap_or(stamp.timestamp),
        clock: stamp.clock,
    };
    let notification = (record.dst.clone(), serde_json::to_value(&record)?);
    let mutation = commit(env, Mutation::Message(record), stamp)?;

    Ok(HandlerOutcome {
        notification: mutation.as_ref().map(|_| notification),
        mutation,
        ..HandlerOutcome::reply(json!({}))
    })
}

fn handle_history(env: &HandlerEnv<'_>, data: &Value, _stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let HistoryData { channel } = parse(data)?;
    let messages = env.store.read(|state| state.history(&channel))?;
    Ok(HandlerOutcome::reply(json!({ "messages": messages })))
}

fn handle_clock(_env: &HandlerEnv<'_>, _data: &Value, _stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    Ok(HandlerOutcome::reply(json!({ "time": unix_now() })))
}

/// Liveness check from a lower-priority peer
fn handle_election(env: &HandlerEnv<'_>, _data: &Value, _stamp: Stamp) -> Result<HandlerOutcome, ServiceError> {
    let coordinator = env.ctx.coordinator();
    if coordinator.is_none() {
        env.election.nudge();
    }
    let reply = ElectionReply {
        alive: true,
        rank: env.ctx.rank(),
        name: env.ctx.name().to_string(),
        coordinator,
    };
    Ok(HandlerOutcome::reply(serde_json::to_value(reply)?))
}
