//! Entity entries: per-instance tracking state.
//!
//! Lifecycle of a tracked instance:
//!
//! ```text
//! TRANSIENT --persist/load/merge--> MANAGED --remove--> DELETED --delete executes--> GONE
//!                                   MANAGED <--set_read_only--> READ_ONLY
//!                                   MANAGED --evict/clear/close--> DETACHED (entry discarded)
//! ```
//!
//! TRANSIENT and DETACHED instances have no entry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use unitwork_core::{EntityKey, EntityRef, InstanceId, LockMode, Value};

use crate::snapshot::Snapshot;

/// Status of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Tracked and subject to dirty checking.
    Managed,
    /// Tracked, never dirty-checked.
    ReadOnly,
    /// Scheduled for deletion; still in the identity map.
    Deleted,
    /// Row deleted by this flush; purged when the flush completes.
    Gone,
}

impl EntityStatus {
    /// Managed or read-only.
    pub const fn is_live(self) -> bool {
        matches!(self, EntityStatus::Managed | EntityStatus::ReadOnly)
    }
}

/// Tracking record for one managed instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub(crate) entity: EntityRef,
    pub(crate) status: EntityStatus,
    pub(crate) key: Option<EntityKey>,
    pub(crate) loaded_state: Option<Snapshot>,
    pub(crate) lock_mode: LockMode,
    pub(crate) version: Option<Value>,
    pub(crate) exists_in_database: bool,
    pub(crate) seq: u64,
}

impl EntityEntry {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// Key, once the identifier is known.
    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    /// State as last synchronized; `None` before the insert and while
    /// read-only.
    pub fn loaded_state(&self) -> Option<&Snapshot> {
        self.loaded_state.as_ref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Optimistic-lock value; `None` for unversioned types.
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Registration order within the context.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub(crate) fn upgrade_lock(&mut self, mode: LockMode) {
        if mode.greater_than(self.lock_mode) {
            self.lock_mode = mode;
        }
    }
}

/// The entity entry table, keyed by object identity.
#[derive(Debug, Default)]
pub struct EntityEntries {
    entries: HashMap<InstanceId, EntityEntry>,
    next_seq: u64,
}

impl EntityEntries {
    pub(crate) fn insert(
        &mut self,
        entity: &EntityRef,
        status: EntityStatus,
        key: Option<EntityKey>,
        exists_in_database: bool,
    ) -> &mut EntityEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        let version = {
            let guard = entity.read();
            guard
                .descriptor()
                .is_versioned()
                .then(|| guard.version().clone())
        };
        let entry = EntityEntry {
            entity: entity.clone(),
            status,
            key,
            loaded_state: None,
            lock_mode: LockMode::None,
            version,
            exists_in_database,
            seq,
        };
        match self.entries.entry(entity.instance_id()) {
            Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(entry),
        }
    }

    pub fn get(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.entries.get(&instance)
    }

    pub(crate) fn get_mut(&mut self, instance: InstanceId) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&instance)
    }

    pub(crate) fn remove(&mut self, instance: InstanceId) -> Option<EntityEntry> {
        self.entries.remove(&instance)
    }

    pub fn contains(&self, instance: InstanceId) -> bool {
        self.entries.contains_key(&instance)
    }

    pub fn status(&self, instance: InstanceId) -> Option<EntityStatus> {
        self.entries.get(&instance).map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instance ids in registration order.
    pub fn ordered_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<(u64, InstanceId)> =
            self.entries.iter().map(|(id, e)| (e.seq, *id)).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
