//! Dirty checking.
//!
//! Compares an entity's current values with its loaded-state snapshot and
//! reports the indexes of changed properties. Associations compare by target
//! identity or key, embedded values by deep equality, and collections by the
//! wrapper's dirty flag. The version is not a property and never shows up
//! here.

use unitwork_core::{EntityType, PropertyValue};

use crate::entry::{EntityEntry, EntityStatus};
use crate::snapshot::SnapshotValue;

/// Indexes of changed properties, in property order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyChangeVector {
    changed: Vec<usize>,
}

impl PropertyChangeVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_indexes(mut indexes: Vec<usize>) -> Self {
        indexes.sort_unstable();
        indexes.dedup();
        Self { changed: indexes }
    }

    pub fn push(&mut self, index: usize) {
        if let Err(pos) = self.changed.binary_search(&index) {
            self.changed.insert(pos, index);
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.changed.binary_search(&index).is_ok()
    }

    pub fn indexes(&self) -> &[usize] {
        &self.changed
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len()
    }

    /// Changed properties that map to a column of the entity's table.
    pub fn columns<'a>(&'a self, descriptor: &'a EntityType) -> impl Iterator<Item = usize> + 'a {
        self.changed
            .iter()
            .copied()
            .filter(|&i| descriptor.property_at(i).is_some_and(|p| p.has_column()))
    }

    /// Changed collection properties.
    pub fn collections<'a>(&'a self, descriptor: &'a EntityType) -> impl Iterator<Item = usize> + 'a {
        self.changed
            .iter()
            .copied()
            .filter(|&i| descriptor.property_at(i).is_some_and(|p| p.is_collection()))
    }
}

/// Compute the properties of a managed instance that differ from its
/// loaded state.
///
/// Read-only entries, immutable types and instances without a snapshot
/// yield an empty vector. Immutable and non-updatable properties are never
/// compared.
pub fn compute_dirty(
    descriptor: &EntityType,
    current: &[PropertyValue],
    entry: &EntityEntry,
) -> PropertyChangeVector {
    let mut dirty = PropertyChangeVector::new();
    if entry.status() != EntityStatus::Managed || !descriptor.mutable {
        return dirty;
    }
    let Some(loaded) = entry.loaded_state() else {
        return dirty;
    };

    for (index, property) in descriptor.properties().iter().enumerate() {
        if !property.mutable || !property.updatable {
            continue;
        }
        let Some(value) = current.get(index) else {
            continue;
        };
        let changed = match value {
            PropertyValue::Collection(collection) => {
                collection.is_initialized() && collection.is_dirty()
            }
            other => loaded
                .get(index)
                .is_none_or(|before| !before.matches(&SnapshotValue::of(other))),
        };
        if changed {
            tracing::trace!(
                entity = descriptor.name,
                property = property.name,
                "Property dirty"
            );
            dirty.push(index);
        }
    }
    dirty
}
