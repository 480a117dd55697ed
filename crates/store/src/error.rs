//! Store errors

use thiserror::Error;

/// Errors raised by the replicated state store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel already exists: {0}")]
    ChannelExists(String),

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl StoreError {
    /// Validation errors are reported to the requesting client only
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::UnknownUser(_)
                | StoreError::UnknownChannel(_)
                | StoreError::ChannelExists(_)
                | StoreError::EmptyField(_)
        )
    }
}
