//! Identity of rows, collections and in-memory instances.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

/// The `(entity type, identifier)` pair uniquely identifying a row.
///
/// Two managed instances with equal keys inside one persistence context is
/// an invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity_type: &'static str,
    id: Value,
}

impl EntityKey {
    /// Create a key. The identifier must not be NULL.
    ///
    /// Integer identifiers are widened (see [`Value::into_identifier`]).
    pub fn new(entity_type: &'static str, id: impl Into<Value>) -> Self {
        Self {
            entity_type,
            id: id.into().into_identifier(),
        }
    }

    /// Entity type name.
    pub const fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Identifier value.
    pub const fn id(&self) -> &Value {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.id)
    }
}

/// Identity of a managed collection: its role plus the owner's key.
///
/// The role is the owning entity type and property name joined with a dot,
/// e.g. `Parent.children`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub role: String,
    pub owner: EntityKey,
}

impl CollectionKey {
    pub fn new(owner: EntityKey, property: &str) -> Self {
        Self {
            role: format!("{}.{}", owner.entity_type(), property),
            owner,
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.role, self.owner.id())
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one in-memory entity instance.
///
/// Transient instances have no identifier yet, so object identity is what
/// the cascade visited-set and the entry table are keyed by. Ids grow
/// monotonically in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for diagnostics.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}
