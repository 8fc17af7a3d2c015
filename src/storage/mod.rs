//! Snapshot storage
//!
//! Holds the latest accepted snapshot per series key. Snapshots are
//! replaced wholesale; readers get a shared handle and never observe a
//! partially written snapshot.

mod snapshot;
pub use snapshot::{RemoteResources, SeriesSnapshot};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::model::{MetricEntry, SeriesKey};

#[derive(Debug, Default)]
pub struct SeriesStore {
    snapshots: RwLock<HashMap<SeriesKey, Arc<SeriesSnapshot>>>,
}

impl SeriesStore {
    pub fn new() -> Self {
        SeriesStore::default()
    }

    pub fn get(&self, key: &SeriesKey) -> Option<Arc<SeriesSnapshot>> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        snapshots.get(key).cloned()
    }

    /// Store `entries` under `key` unless a snapshot with an equal or higher
    /// sequence number is already present. Returns whether it was accepted.
    pub fn put(&self, key: SeriesKey, sequence: u64, entries: Vec<MetricEntry>) -> bool {
        self.insert(SeriesSnapshot::new(key, sequence, entries))
    }

    /// Same acceptance rule as [`SeriesStore::put`], for a fully built snapshot.
    pub fn insert(&self, snapshot: SeriesSnapshot) -> bool {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = snapshots.get(&snapshot.key) {
            if snapshot.sequence <= current.sequence {
                debug!(
                    key = %snapshot.key,
                    sequence = snapshot.sequence,
                    stored = current.sequence,
                    "Discarding stale snapshot"
                );
                return false;
            }
        }

        snapshots.insert(snapshot.key.clone(), Arc::new(snapshot));
        true
    }

    pub fn remove(&self, key: &SeriesKey) -> Option<Arc<SeriesSnapshot>> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.remove(key)
    }

    pub fn sequence(&self, key: &SeriesKey) -> Option<u64> {
        self.get(key).map(|snapshot| snapshot.sequence)
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        snapshots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
