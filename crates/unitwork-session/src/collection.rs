//! Tracking of managed collections.
//!
//! Each to-many property of a managed owner has a [`CollectionEntry`]
//! holding the elements as last synchronized. The wrapper's dirty flag says
//! whether anything changed; the snapshot says what.

use std::collections::HashMap;

use unitwork_core::{CollectionKey, EntityRef, InstanceId};

/// Snapshot of one managed collection.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub(crate) owner: InstanceId,
    pub(crate) property: usize,
    pub(crate) role: String,
    /// `None` until the collection is read or first written.
    pub(crate) snapshot: Option<Vec<EntityRef>>,
}

impl CollectionEntry {
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn property(&self) -> usize {
        self.property
    }

    /// `Type.property` role name.
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn snapshot(&self) -> Option<&[EntityRef]> {
        self.snapshot.as_deref()
    }

    /// Elements added and removed relative to the snapshot, by identity.
    pub fn diff(&self, current: &[EntityRef]) -> (Vec<EntityRef>, Vec<EntityRef>) {
        let before = self.snapshot.as_deref().unwrap_or_default();
        let added = current
            .iter()
            .filter(|e| !before.iter().any(|b| b.ptr_eq(e)))
            .cloned()
            .collect();
        let removed = before
            .iter()
            .filter(|b| !current.iter().any(|e| e.ptr_eq(b)))
            .cloned()
            .collect();
        (added, removed)
    }
}

/// Collection entries keyed by owner instance and property index.
#[derive(Debug, Default)]
pub struct CollectionEntries {
    entries: HashMap<(InstanceId, usize), CollectionEntry>,
}

impl CollectionEntries {
    pub(crate) fn track(
        &mut self,
        owner: InstanceId,
        property: usize,
        role: String,
        snapshot: Option<Vec<EntityRef>>,
    ) {
        self.entries.insert(
            (owner, property),
            CollectionEntry {
                owner,
                property,
                role,
                snapshot,
            },
        );
    }

    pub fn get(&self, owner: InstanceId, property: usize) -> Option<&CollectionEntry> {
        self.entries.get(&(owner, property))
    }

    pub(crate) fn set_snapshot(&mut self, owner: InstanceId, property: usize, elements: Vec<EntityRef>) {
        if let Some(entry) = self.entries.get_mut(&(owner, property)) {
            entry.snapshot = Some(elements);
        }
    }

    /// Forget every collection of `owner`.
    pub(crate) fn remove_owner(&mut self, owner: InstanceId) {
        self.entries.retain(|(o, _), _| *o != owner);
    }

    /// Entry matching a public collection key, given the owner instance.
    pub fn find(&self, owner: InstanceId, key: &CollectionKey) -> Option<&CollectionEntry> {
        self.entries
            .values()
            .find(|e| e.owner == owner && e.role == key.role)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
