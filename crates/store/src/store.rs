//! Thread-safe state store
//!
//! A single mutex covers "read state, mutate, persist" so request handlers
//! and replication apply never interleave a read-modify-write cycle.

use crate::{
    error::StoreError,
    persistence::{PersistentStore, StoreMetadata},
    state::{Mutation, ReplicatedState},
};
use parking_lot::Mutex;
use std::path::Path;

/// Shared handle to the node's replicated state
pub struct StateStore {
    state: Mutex<ReplicatedState>,
    persistence: Option<PersistentStore>,
    /// Clock recorded by the last save found on disk
    restored_clock: u64,
}

impl StateStore {
    /// A store that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(ReplicatedState::new()),
            persistence: None,
            restored_clock: 0,
        }
    }

    /// Open the store under `path`, loading any previously saved state
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let persistence = PersistentStore::open(path)?;

        let state = persistence.load_state()?.unwrap_or_default();
        let restored_clock = match persistence.load_metadata()? {
            Some(metadata) => {
                tracing::info!(
                    "Loaded state: {} users, {} channels, {} messages, clock {}",
                    metadata.users,
                    metadata.channels,
                    metadata.messages,
                    metadata.clock
                );
                metadata.clock
            }
            None => {
                tracing::info!("No existing state found, starting fresh");
                0
            }
        };

        Ok(Self {
            state: Mutex::new(state),
            persistence: Some(persistence),
            restored_clock,
        })
    }

    /// Logical clock value recorded by the last save before this process started
    pub fn restored_clock(&self) -> u64 {
        self.restored_clock
    }

    /// Validate and apply a locally originated mutation.
    ///
    /// Returns `Ok(true)` when the state changed and the mutation must be
    /// propagated, `Ok(false)` when it was already present.
    pub fn commit(&self, mutation: &Mutation, clock: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.validate(mutation)?;
        let changed = state.apply(mutation);
        if changed {
            self.persist(&state, clock);
        }
        Ok(changed)
    }

    /// Apply a mutation received from a peer, skipping validation
    pub fn apply_replicated(&self, mutation: &Mutation, clock: u64) -> bool {
        let mut state = self.state.lock();
        let changed = state.apply(mutation);
        if changed {
            self.persist(&state, clock);
        }
        changed
    }

    /// Run `f` against the current state
    pub fn read<R>(&self, f: impl FnOnce(&ReplicatedState) -> R) -> R {
        let state = self.state.lock();
        f(&*state)
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> ReplicatedState {
        self.state.lock().clone()
    }

    /// Save and flush the current state (used on shutdown)
    pub fn save(&self, clock: u64) -> Result<Option<StoreMetadata>, StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };
        let state = self.state.lock();
        persistence.save(&state, clock)?;
        persistence.flush()?;
        Ok(Some(StoreMetadata::describe(&state, clock)))
    }

    fn persist(&self, state: &ReplicatedState, clock: u64) {
        if let Some(persistence) = &self.persistence {
            // The in-memory mutation stands even if the write fails
            if let Err(e) = persistence.save(state, clock) {
                tracing::error!("Failed to persist state: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChannelMessage, Subscription};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_commit_validates_and_reports_change() {
        let store = StateStore::in_memory();
        let login = Mutation::Login { user: "alice".to_string() };

        assert!(store.commit(&login, 1).unwrap());
        // Repeat login succeeds without a change
        assert!(!store.commit(&login, 2).unwrap());

        let sub = Mutation::Subscribe(Subscription {
            user: "alice".to_string(),
            channel: "geral".to_string(),
        });
        assert!(store.commit(&sub, 3).is_err());
        assert!(store.read(|s| s.subscriptions.is_empty()));
    }

    #[test]
    fn test_reopen_restores_state_and_clock() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.commit(&Mutation::Login { user: "alice".to_string() }, 3).unwrap();
            store.commit(&Mutation::Channel { channel: "geral".to_string() }, 5).unwrap();
            store.save(9).unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.restored_clock(), 9);
        assert!(store.read(|s| s.has_user("alice") && s.has_channel("geral")));
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(StateStore::in_memory());
        store.commit(&Mutation::Login { user: "alice".to_string() }, 1).unwrap();
        store.commit(&Mutation::Channel { channel: "geral".to_string() }, 2).unwrap();

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..25u64 {
                        let msg = Mutation::Publish(ChannelMessage {
                            user: "alice".to_string(),
                            channel: "geral".to_string(),
                            message: format!("{}-{}", i, j),
                            timestamp: 0.0,
                            clock: i * 100 + j,
                        });
                        store.commit(&msg, i * 100 + j).unwrap();
                        // Replayed envelope for the same record
                        store.apply_replicated(&msg, i * 100 + j);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read(|s| s.messages.len()), 200);
    }
}
