//! Persistence layer for replicated state
//!
//! Uses sled embedded database. The whole state is written as one snapshot
//! inside the same critical section that mutated it.

use crate::{error::StoreError, state::ReplicatedState};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

const SNAPSHOT_KEY: &str = "snapshot";
const METADATA_KEY: &str = "store";

/// Metadata saved alongside every snapshot
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoreMetadata {
    /// Logical clock at the time of the save
    pub clock: u64,
    /// Unix seconds of the save
    pub saved_at: i64,
    pub users: u64,
    pub channels: u64,
    pub messages: u64,
}

impl StoreMetadata {
    pub fn describe(state: &ReplicatedState, clock: u64) -> Self {
        Self {
            clock,
            saved_at: chrono::Utc::now().timestamp(),
            users: state.users.len() as u64,
            channels: state.channels.len() as u64,
            messages: (state.messages.len() + state.private_messages.len()) as u64,
        }
    }
}

/// Persistent storage for the replicated state
pub struct PersistentStore {
    db: Db,
    state: sled::Tree,
    metadata: sled::Tree,
}

impl PersistentStore {
    /// Open or create a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        let state = db.open_tree("state")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened persistent store at {:?}", path.as_ref());

        Ok(Self { db, state, metadata })
    }

    /// Replace the stored snapshot and its metadata
    pub fn save(&self, state: &ReplicatedState, clock: u64) -> Result<(), StoreError> {
        let bytes = bincode::serialize(state)?;
        self.state.insert(SNAPSHOT_KEY, bytes)?;

        let metadata = bincode::serialize(&StoreMetadata::describe(state, clock))?;
        self.metadata.insert(METADATA_KEY, metadata)?;
        Ok(())
    }

    /// Load the stored snapshot, if any
    pub fn load_state(&self) -> Result<Option<ReplicatedState>, StoreError> {
        match self.state.get(SNAPSHOT_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load the metadata of the last save
    pub fn load_metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
        match self.metadata.get(METADATA_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
