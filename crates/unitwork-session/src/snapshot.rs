//! Loaded-state snapshots.
//!
//! A snapshot records each property as last synchronized with the database.
//! Associations are recorded by target identity and key rather than by
//! value, so the snapshot never holds a lock on another entity.

use std::collections::BTreeMap;

use unitwork_core::{EntityKey, InstanceId, PropertyValue, Reference, Value};

/// Recorded target of a to-one association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSnapshot {
    /// Target instance, when it was loaded in memory.
    pub instance: Option<InstanceId>,
    /// Target key, when it had an identifier.
    pub key: Option<EntityKey>,
}

impl RefSnapshot {
    pub fn of(reference: &Reference) -> Option<Self> {
        match reference {
            Reference::Null => None,
            Reference::Unloaded(key) => Some(Self {
                instance: None,
                key: Some(key.clone()),
            }),
            Reference::Loaded(target) => Some(Self {
                instance: Some(target.instance_id()),
                key: target.key(),
            }),
        }
    }

    /// Identity-or-key equality.
    pub fn same_target(&self, other: &RefSnapshot) -> bool {
        if let (Some(a), Some(b)) = (self.instance, other.instance) {
            if a == b {
                return true;
            }
        }
        matches!((&self.key, &other.key), (Some(a), Some(b)) if a == b)
    }
}

/// One property of a snapshot.
#[derive(Debug, Clone)]
pub enum SnapshotValue {
    Scalar(Value),
    Embedded(BTreeMap<String, Value>),
    Reference(Option<RefSnapshot>),
    /// Collections are tracked by their own entry.
    Collection,
}

impl SnapshotValue {
    pub fn of(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Scalar(v) => SnapshotValue::Scalar(v.clone()),
            PropertyValue::Embedded(m) => SnapshotValue::Embedded(m.clone()),
            PropertyValue::Reference(r) => SnapshotValue::Reference(RefSnapshot::of(r)),
            PropertyValue::Collection(_) => SnapshotValue::Collection,
        }
    }

    /// Type-specific equality used by dirty checking.
    pub fn matches(&self, other: &SnapshotValue) -> bool {
        match (self, other) {
            (SnapshotValue::Scalar(a), SnapshotValue::Scalar(b)) => a == b,
            (SnapshotValue::Embedded(a), SnapshotValue::Embedded(b)) => a == b,
            (SnapshotValue::Reference(None), SnapshotValue::Reference(None)) => true,
            (SnapshotValue::Reference(Some(a)), SnapshotValue::Reference(Some(b))) => {
                a.same_target(b)
            }
            (SnapshotValue::Collection, SnapshotValue::Collection) => true,
            _ => false,
        }
    }

    pub fn reference(&self) -> Option<&RefSnapshot> {
        match self {
            SnapshotValue::Reference(r) => r.as_ref(),
            _ => None,
        }
    }
}

/// Property values as last synchronized, indexed by property order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    values: Vec<SnapshotValue>,
}

impl Snapshot {
    /// Capture current values.
    ///
    /// Takes owned values rather than an entity guard: recording a loaded
    /// reference reads the target's key, which may be the entity itself.
    pub fn capture(values: &[PropertyValue]) -> Self {
        Self {
            values: values.iter().map(SnapshotValue::of).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&SnapshotValue> {
        self.values.get(index)
    }

    pub fn set(&mut self, index: usize, value: SnapshotValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub fn values(&self) -> &[SnapshotValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
