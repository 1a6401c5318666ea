//! In-memory execution log store.
//!
//! Every admitted request gets exactly one entry, reachable by tracking ID
//! and, once its action is known, through that action's list. Entries are
//! never removed. Admission decisions scan an action's list while holding
//! the index lock, so two chains cannot both read a count and then both
//! append past a limit.
//!
//! Lock order: index, then entry. Nothing may hold an entry lock while
//! taking the index lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::domain::InternalLogEntry;

/// A log entry shared between the owning chain and readers
pub type SharedLogEntry = Arc<Mutex<InternalLogEntry>>;

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct LogIndex {
    logs: HashMap<String, SharedLogEntry>,
    by_action: HashMap<String, Vec<SharedLogEntry>>,
}

/// Global and per-action log indices
#[derive(Default)]
pub struct LogStore {
    index: Mutex<LogIndex>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new entry.
    ///
    /// The requested tracking ID is kept unless it is empty or already in
    /// use, in which case a fresh UUID is assigned. Returns the tracking ID
    /// actually used and the shared entry.
    pub fn register(
        &self,
        requested_tracking_id: &str,
        action_id: Option<&str>,
        build: impl FnOnce(&str) -> InternalLogEntry,
    ) -> (String, SharedLogEntry) {
        let mut index = lock(&self.index);

        let tracking_id = if requested_tracking_id.is_empty()
            || index.logs.contains_key(requested_tracking_id)
        {
            Uuid::new_v4().to_string()
        } else {
            requested_tracking_id.to_string()
        };

        let entry = Arc::new(Mutex::new(build(&tracking_id)));
        index.logs.insert(tracking_id.clone(), Arc::clone(&entry));

        if let Some(action_id) = action_id {
            index
                .by_action
                .entry(action_id.to_string())
                .or_default()
                .push(Arc::clone(&entry));
        }

        (tracking_id, entry)
    }

    /// Run a closure over an action's entries while holding the index lock
    pub fn with_action_logs<R>(&self, action_id: &str, f: impl FnOnce(&[SharedLogEntry]) -> R) -> R {
        let index = lock(&self.index);
        let entries = index
            .by_action
            .get(action_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        f(entries)
    }

    /// The shared entry for a tracking ID
    pub fn entry(&self, tracking_id: &str) -> Option<SharedLogEntry> {
        lock(&self.index).logs.get(tracking_id).cloned()
    }

    /// Snapshot of one entry
    pub fn get(&self, tracking_id: &str) -> Option<InternalLogEntry> {
        let entry = self.entry(tracking_id)?;
        let snapshot = lock(&entry).clone();
        Some(snapshot)
    }

    /// Snapshots of an action's entries, in registration order
    pub fn for_action(&self, action_id: &str) -> Vec<InternalLogEntry> {
        let entries: Vec<SharedLogEntry> =
            self.with_action_logs(action_id, |entries| entries.to_vec());
        entries.iter().map(|e| lock(e).clone()).collect()
    }

    /// Snapshots of every entry, oldest first
    pub fn all(&self) -> Vec<InternalLogEntry> {
        let entries: Vec<SharedLogEntry> = lock(&self.index).logs.values().cloned().collect();
        let mut snapshots: Vec<InternalLogEntry> = entries.iter().map(|e| lock(e).clone()).collect();
        snapshots.sort_by(|a, b| a.datetime_started.cmp(&b.datetime_started));
        snapshots
    }

    /// Whether a tracking ID is registered
    pub fn contains(&self, tracking_id: &str) -> bool {
        lock(&self.index).logs.contains_key(tracking_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.index).logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
