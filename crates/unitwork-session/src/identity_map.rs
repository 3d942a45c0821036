//! Identity Map: one managed instance per row.
//!
//! Within one persistence context a key maps to exactly one [`EntityRef`].
//! Loading the same row twice hands back the same object, so reference
//! equality is meaningful for loaded entities and a change made through one
//! handle is visible through every other.
//!
//! The map performs no locking of its own; a persistence context is used
//! from one thread of control at a time.

use std::collections::HashMap;

use unitwork_core::{EntityKey, EntityRef, Error, Result};

/// Maps entity keys to managed instances.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Managed instance registered under `key`.
    pub fn get(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.entries.get(key)
    }

    /// Register `entity` under `key`.
    ///
    /// Re-registering the same instance is a no-op; a different instance
    /// under an equal key fails with `IdentityConflict` and leaves the map
    /// unchanged.
    pub fn put(&mut self, key: EntityKey, entity: &EntityRef) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.ptr_eq(entity) {
                return Ok(());
            }
            tracing::warn!(key = %key, "Identity conflict");
            return Err(Error::IdentityConflict { key });
        }
        tracing::trace!(key = %key, instance = %entity.instance_id(), "Identity map put");
        self.entries.insert(key, entity.clone());
        Ok(())
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }
}
