//! Mesh Server - chat operations served by a mesh node
//!
//! This crate provides:
//! - The closed set of client operations and their payloads
//! - Handlers over the replicated store
//! - The request dispatcher (clock merge, propagation, notifications)
//! - Node assembly and background task startup

pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod node;
pub mod ops;

#[cfg(test)]
mod tests;

pub use dispatcher::Dispatcher;
pub use error::ServiceError;
pub use handlers::{handler_for, Handler, HandlerEnv, HandlerOutcome, Stamp};
pub use node::{MeshNode, NodeBuilder};
pub use ops::OpKind;
