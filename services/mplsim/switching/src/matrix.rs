//! The per-node switching matrix.

use dashmap::DashMap;
use mplsim_topology::PortId;
use mplsim_wire::{Label, FIRST_UNRESERVED_LABEL, MAX_LABEL};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

use crate::entry::{Entry, EntryId, EntryKey};
use crate::error::SwitchingError;

/// Hands out labels from the unreserved range of one node
#[derive(Debug)]
pub struct LabelAllocator {
    next: AtomicU32,
}

impl LabelAllocator {
    /// Start at the first unreserved label
    pub fn new() -> Self {
        Self::starting_at(FIRST_UNRESERVED_LABEL)
    }

    /// Start at `first`
    pub fn starting_at(first: Label) -> Self {
        Self {
            next: AtomicU32::new(first.max(FIRST_UNRESERVED_LABEL)),
        }
    }

    /// Next free label
    pub fn allocate(&self) -> Result<Label, SwitchingError> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next <= MAX_LABEL).then_some(next + 1)
            })
            .map_err(|_| SwitchingError::LabelSpaceExhausted)
    }
}

impl Default for LabelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Entries of one node, unique per [`EntryKey`]
///
/// Lookups return copies. Callers update the copy and store it back with
/// [`upsert`](Self::upsert), which keeps the key index in step.
#[derive(Debug, Default)]
pub struct SwitchingMatrix {
    entries: DashMap<EntryId, Entry>,
    index: DashMap<EntryKey, EntryId>,
    next_entry_id: AtomicU64,
    labels: LabelAllocator,
}

impl SwitchingMatrix {
    /// Create an empty matrix
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry and return its identifier
    pub fn insert(&self, mut entry: Entry) -> Result<EntryId, SwitchingError> {
        if let Some(key) = entry.key() {
            if self.index.contains_key(&key) {
                return Err(SwitchingError::DuplicateKey(key));
            }
        }

        let id = EntryId(self.next_entry_id.fetch_add(1, Ordering::Relaxed) + 1);
        entry.id = id;
        if let Some(key) = entry.key() {
            self.index.insert(key, id);
        }
        debug!("Inserted switching entry {} toward {}", id, entry.tail_end);
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Store an updated copy of an existing entry
    pub fn upsert(&self, entry: Entry) -> Result<(), SwitchingError> {
        let previous_key = self
            .entries
            .get(&entry.id)
            .map(|current| current.value().key())
            .ok_or(SwitchingError::UnknownEntry(entry.id))?;

        let key = entry.key();
        if let Some(key) = key {
            if let Some(owner) = self.index.get(&key) {
                if *owner != entry.id {
                    return Err(SwitchingError::DuplicateKey(key));
                }
            }
        }

        if previous_key != key {
            if let Some(previous_key) = previous_key {
                self.index.remove(&previous_key);
            }
            if let Some(key) = key {
                self.index.insert(key, entry.id);
            }
        }
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    /// Copy of an entry
    pub fn get(&self, id: EntryId) -> Option<Entry> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// Entry owning `key`
    pub fn find(&self, key: &EntryKey) -> Option<Entry> {
        let id = *self.index.get(key)?;
        self.get(id)
    }

    /// Entry created for an upstream session arriving on `incoming_port`
    pub fn find_by_upstream_session(&self, incoming_port: PortId, session_id: u32) -> Option<Entry> {
        self.entries
            .iter()
            .find(|e| e.incoming_port == incoming_port && e.upstream_session_id == Some(session_id))
            .map(|e| e.value().clone())
    }

    /// Entry whose local session is `session_id`
    pub fn find_by_local_session(&self, session_id: u32) -> Option<Entry> {
        self.entries
            .iter()
            .find(|e| e.local_session_id == session_id)
            .map(|e| e.value().clone())
    }

    /// Remove an entry
    pub fn remove(&self, id: EntryId) -> Option<Entry> {
        let (_, entry) = self.entries.remove(&id)?;
        if let Some(key) = entry.key() {
            self.index.remove_if(&key, |_, owner| *owner == id);
        }
        debug!("Removed switching entry {} toward {}", id, entry.tail_end);
        Some(entry)
    }

    /// Remove every entry matching `predicate` and return them
    ///
    /// Matching identifiers are collected first and removed afterwards, so
    /// no map shard is locked while entries are being dropped. This is the
    /// only way to remove entries during a scan.
    pub fn purge_where<F>(&self, mut predicate: F) -> Vec<Entry>
    where
        F: FnMut(&Entry) -> bool,
    {
        let doomed: Vec<EntryId> = self
            .entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| *e.key())
            .collect();

        doomed.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Copies of all entries, ordered by identifier
    pub fn snapshot(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the matrix is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate a label local to this node
    pub fn allocate_label(&self) -> Result<Label, SwitchingError> {
        self.labels.allocate()
    }
}
