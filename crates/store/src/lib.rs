//! Mesh Store - the replicated application state
//!
//! - Users, channels, subscriptions, channel and private messages
//! - Validation for locally originated mutations
//! - Idempotent, validation-free apply for replicated mutations
//! - sled-backed snapshot persistence

pub mod error;
pub mod persistence;
pub mod state;
pub mod store;

pub use error::StoreError;
pub use persistence::{PersistentStore, StoreMetadata};
pub use state::{ChannelMessage, Mutation, PrivateMessage, ReplicatedState, Subscription};
pub use store::StateStore;
