//! Learning-state persistence seam.
//!
//! The engine owns no storage: it talks to a key-value collaborator through
//! this trait. Writes are versioned compare-and-swap so concurrent outcome
//! arrivals for the same key never lose updates.

use arbiter_types::{LearningState, StateKey};
use dashmap::DashMap;

/// External key-value collaborator holding [`LearningState`] entries.
///
/// Readers may observe stale values (eventual consistency); writers must go
/// through `compare_and_swap`. Entries are never deleted.
pub trait LearningStore: Send + Sync {
    /// Current state for a key, if one has ever been written.
    fn get(&self, key: &StateKey) -> Option<LearningState>;

    /// Write `new` if the stored version still equals `expected_version`.
    ///
    /// A missing key counts as version 0. On success the stored version
    /// becomes `expected_version + 1`. Returns false on a lost race; the
    /// caller re-reads and retries.
    fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new: LearningState,
    ) -> bool;
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLearningStore {
    entries: DashMap<StateKey, LearningState>,
}

impl InMemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key with explicit state (version reset to 1).
    pub fn seed(&self, key: StateKey, mut state: LearningState) {
        state.version = 1;
        self.entries.insert(key, state);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LearningStore for InMemoryLearningStore {
    fn get(&self, key: &StateKey) -> Option<LearningState> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        mut new: LearningState,
    ) -> bool {
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().version != expected_version {
                    return false;
                }
                new.version = expected_version + 1;
                occupied.insert(new);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return false;
                }
                new.version = 1;
                vacant.insert(new);
                true
            }
        }
    }
}
