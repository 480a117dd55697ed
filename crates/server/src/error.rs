//! Dispatcher errors

use mesh_store::StoreError;
use thiserror::Error;

/// Errors a request handler can report back to the client
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid payload: {0}")]
    BadPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::BadPayload(e.to_string())
    }
}
