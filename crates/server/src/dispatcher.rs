//! Request dispatcher

use crate::{
    error::ServiceError,
    handlers::{handler_for, HandlerEnv, Stamp},
    ops::OpKind,
};
use async_trait::async_trait;
use mesh_bus::{unix_now, FanOut, Reply, Request, RequestHandler};
use mesh_consensus::{Election, NodeContext, Replicator};
use mesh_store::StateStore;
use serde_json::Value;
use std::sync::Arc;

/// Serves client operations: observe, handle, propagate, notify, stamp
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    store: Arc<StateStore>,
    election: Arc<Election>,
    replicator: Arc<Replicator>,
    bus: Arc<dyn FanOut>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<NodeContext>,
        store: Arc<StateStore>,
        election: Arc<Election>,
        replicator: Arc<Replicator>,
        bus: Arc<dyn FanOut>,
    ) -> Self {
        Self {
            ctx,
            store,
            election,
            replicator,
            bus,
        }
    }

    async fn dispatch(&self, request: Request, stamp: Stamp) -> Reply {
        let kind = match request.service.parse::<OpKind>() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!("Rejected request: {}", e);
                return Reply::error("error", e.to_string());
            }
        };

        let env = HandlerEnv {
            ctx: &self.ctx,
            store: &self.store,
            election: &self.election,
        };
        let outcome = match handler_for(kind)(&env, &request.data, stamp) {
            Ok(outcome) => outcome,
            Err(ServiceError::Store(e)) if !e.is_validation() => {
                tracing::error!("{} failed in storage: {}", kind, e);
                return Reply::error(kind.as_str(), e.to_string());
            }
            Err(e) => {
                tracing::debug!("{} rejected: {}", kind, e);
                return Reply::error(kind.as_str(), e.to_string());
            }
        };

        if let Some(mutation) = outcome.mutation {
            self.replicator.propagate(mutation).await;
        }
        if let Some((topic, mut payload)) = outcome.notification {
            // The record keeps its creation clock in history; subscribers see the send tick
            let clock = self.ctx.clock().tick();
            if let Value::Object(fields) = &mut payload {
                fields.insert("clock".to_string(), Value::from(clock));
            }
            if let Err(e) = self.bus.publish(&topic, payload).await {
                tracing::warn!("Failed to notify topic {}: {}", topic, e);
            }
        }

        Reply::success(kind.as_str(), outcome.data)
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: Request) -> Reply {
        let stamp = Stamp {
            clock: self.ctx.clock().observe(request.clock),
            timestamp: unix_now(),
        };
        tracing::trace!("Request {} (clock {})", request.service, request.clock);

        let reply = self.dispatch(request, stamp).await;
        reply.with_clock(self.ctx.clock().tick())
    }
}
