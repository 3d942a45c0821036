//! Context operations that read or register instances.
//!
//! [`Engine`] borrows a persistence context's state together with its
//! collaborators for the duration of one public call. Loading, cascading
//! persist/remove/merge/refresh/lock and the flush all run through it.

use std::collections::{HashMap, VecDeque};

use unitwork_core::{
    ActionKind, CacheRegion, CascadeOp, CollectionMapping, Entity, EntityKey, EntityRef,
    EntityType, Error, IdGeneration, InstanceId, LockMode, MetadataModel, PropertyKind,
    PropertyValue, Reference, Result, Row, SqlExecutor, Value,
};

use crate::cascade::{self, AssociationLoader};
use crate::collection::CollectionEntries;
use crate::config::SessionConfig;
use crate::entry::{EntityEntries, EntityStatus};
use crate::flush::FlushState;
use crate::hydrate;
use crate::identity_map::IdentityMap;
use crate::snapshot::Snapshot;

/// Mutable state owned by one persistence context.
#[derive(Debug, Default)]
pub(crate) struct ContextState {
    pub identity_map: IdentityMap,
    pub entries: EntityEntries,
    pub collections: CollectionEntries,
    /// (deleted first, deleted second) pairs recorded by cascading removes.
    pub delete_hints: Vec<(InstanceId, InstanceId)>,
    pub flush_state: FlushState,
}

impl ContextState {
    pub fn clear(&mut self) {
        self.identity_map.clear();
        self.entries.clear();
        self.collections.clear();
        self.delete_hints.clear();
        self.flush_state = FlushState::Idle;
    }

    /// Forget one instance entirely.
    pub fn detach(&mut self, instance: InstanceId) {
        if let Some(entry) = self.entries.remove(instance) {
            if let Some(key) = entry.key() {
                if self
                    .identity_map
                    .get(key)
                    .is_some_and(|r| r.instance_id() == instance)
                {
                    self.identity_map.remove(key);
                }
            }
        }
        self.collections.remove_owner(instance);
        self.delete_hints
            .retain(|(a, b)| *a != instance && *b != instance);
    }
}

/// `Type.property` collection role.
pub(crate) fn role(descriptor: &EntityType, property: usize) -> String {
    descriptor
        .property_at(property)
        .map_or_else(String::new, |p| format!("{}.{}", descriptor.name, p.name))
}

pub(crate) struct Engine<'a, E: SqlExecutor> {
    pub metadata: &'a dyn MetadataModel,
    pub executor: &'a E,
    pub cache: Option<&'a dyn CacheRegion>,
    pub config: &'a SessionConfig,
    pub state: &'a mut ContextState,
}

impl<E: SqlExecutor> Engine<'_, E> {
    // ==================== Registration ====================

    /// Track the collections of `owner`. Initialized collections of rows
    /// that exist get their elements as snapshot.
    pub fn track_collections(&mut self, owner: &EntityRef, exists: bool) {
        let (descriptor, values) = {
            let guard = owner.read();
            (guard.descriptor().clone(), guard.values().to_vec())
        };
        for (index, value) in values.iter().enumerate() {
            let PropertyValue::Collection(collection) = value else {
                continue;
            };
            let snapshot =
                (exists && collection.is_initialized()).then(|| collection.elements().to_vec());
            self.state.collections.track(
                owner.instance_id(),
                index,
                role(&descriptor, index),
                snapshot,
            );
        }
    }

    /// Register an instance read from the database.
    fn register_loaded(&mut self, entity: &EntityRef, status: EntityStatus) -> Result<()> {
        let key = entity.key().ok_or(Error::NullIdentifier {
            entity_type: entity.entity_type(),
        })?;
        self.state.identity_map.put(key.clone(), entity)?;
        let snapshot = (status == EntityStatus::Managed).then(|| Snapshot::capture(&entity.values()));
        let entry = self
            .state
            .entries
            .insert(entity, status, Some(key), true);
        entry.loaded_state = snapshot;
        entry.lock_mode = LockMode::Read;
        self.track_collections(entity, true);
        Ok(())
    }

    /// Register a transient instance scheduled for insert.
    fn register_new(&mut self, entity: &EntityRef) -> Result<()> {
        let key = entity.key();
        if let Some(key) = &key {
            self.state.identity_map.put(key.clone(), entity)?;
        }
        tracing::debug!(entity = ?entity, "Instance scheduled for insert");
        self.state
            .entries
            .insert(entity, EntityStatus::Managed, key, false);
        self.track_collections(entity, false);
        Ok(())
    }

    // ==================== Second-level cache ====================

    pub fn cache_put(&self, key: &EntityKey, entity: &EntityRef) {
        let Some(cache) = self.cache else {
            return;
        };
        if !self.config.cache_mode.writes() {
            cache.evict(key);
            return;
        }
        if let Err(e) = hydrate::to_row(entity).and_then(|row| cache.put(key, &row)) {
            tracing::warn!(key = %key, error = %e, "Cache put failed");
            cache.evict(key);
        }
    }

    pub fn cache_evict(&self, key: &EntityKey) {
        if let Some(cache) = self.cache {
            cache.evict(key);
        }
    }

    fn cached_row(&self, key: &EntityKey) -> Option<Row> {
        let cache = self.cache?;
        if !self.config.cache_mode.reads() {
            return None;
        }
        let row = cache.get(key);
        tracing::trace!(key = %key, hit = row.is_some(), "Cache lookup");
        row
    }

    // ==================== Loading ====================

    /// Build and register an instance from a row.
    fn materialize(
        &mut self,
        descriptor: &std::sync::Arc<EntityType>,
        row: &Row,
        status: EntityStatus,
    ) -> Result<EntityRef> {
        let state = hydrate::hydrate(descriptor, row, &self.state.identity_map)?;
        let entity = EntityRef::new(Entity::new(descriptor.clone()));
        hydrate::apply(&entity, state)?;
        self.register_loaded(&entity, status)?;
        Ok(entity)
    }

    /// Look up a row by key: identity map, then cache, then the database.
    #[tracing::instrument(level = "debug", skip(self, id), fields(id = %id))]
    pub fn find(
        &mut self,
        entity_type: &str,
        id: Value,
        read_only: bool,
    ) -> Result<Option<EntityRef>> {
        let descriptor = self.metadata.require(entity_type)?;
        let key = EntityKey::new(descriptor.name, id);

        if let Some(existing) = self.state.identity_map.get(&key).cloned() {
            return Ok(match self.state.entries.status(existing.instance_id()) {
                Some(EntityStatus::Deleted | EntityStatus::Gone) => None,
                _ => Some(existing),
            });
        }

        let row = match self.cached_row(&key) {
            Some(row) => Some(row),
            None => {
                let row = self
                    .executor
                    .select_by_id(&descriptor, key.id())
                    .map_err(|e| {
                        Error::from_sql(ActionKind::Load, descriptor.name, Some(key.id().clone()), e)
                    })?;
                if let (Some(row), Some(cache)) = (&row, self.cache) {
                    if self.config.cache_mode.writes() {
                        if let Err(e) = cache.put(&key, row) {
                            tracing::warn!(key = %key, error = %e, "Cache put failed");
                        }
                    }
                }
                row
            }
        };
        let Some(row) = row else {
            tracing::debug!(key = %key, "Row not found");
            return Ok(None);
        };

        let status = if read_only {
            EntityStatus::ReadOnly
        } else {
            EntityStatus::Managed
        };
        let entity = self.materialize(&descriptor, &row, status)?;
        tracing::debug!(key = %key, instance = %entity.instance_id(), "Loaded");
        Ok(Some(entity))
    }

    /// Resolve a to-one association of `owner`, replacing an unloaded key
    /// with the loaded instance.
    pub fn load_reference(&mut self, owner: &EntityRef, property: usize) -> Result<Option<EntityRef>> {
        let reference = owner
            .read()
            .value_at(property)
            .and_then(PropertyValue::as_reference)
            .cloned()
            .ok_or_else(|| Error::UnknownProperty {
                entity_type: owner.entity_type(),
                property: format!("#{property}"),
            })?;
        match reference {
            Reference::Null => Ok(None),
            Reference::Loaded(target) => Ok(Some(target)),
            Reference::Unloaded(key) => {
                let target = self
                    .find(key.entity_type(), key.id().clone(), false)?
                    .ok_or_else(|| Error::ObjectDeleted {
                        entity_type: key.entity_type(),
                        id: key.id().clone(),
                    })?;
                owner.write().set_value_at(
                    property,
                    PropertyValue::Reference(Reference::Loaded(target.clone())),
                )?;
                Ok(Some(target))
            }
        }
    }

    /// Read the elements of a collection of a managed owner.
    pub fn initialize_collection(&mut self, owner: &EntityRef, property: usize) -> Result<Vec<EntityRef>> {
        if !self.state.entries.contains(owner.instance_id()) {
            return Err(Error::NotManaged {
                entity_type: owner.entity_type(),
            });
        }
        let (descriptor, owner_id, current) = {
            let guard = owner.read();
            (
                guard.descriptor().clone(),
                guard.id().clone(),
                guard.value_at(property).and_then(PropertyValue::as_collection).cloned(),
            )
        };
        let Some(current) = current else {
            return Err(Error::UnknownProperty {
                entity_type: descriptor.name,
                property: format!("#{property}"),
            });
        };
        if current.is_initialized() {
            return Ok(current.elements().to_vec());
        }
        let Some(PropertyKind::ToMany { target, mapping }) = descriptor.property_at(property).map(|p| p.kind)
        else {
            return Ok(Vec::new());
        };

        let target_type = self.metadata.require(target)?;
        let mut elements = Vec::new();
        if !owner_id.is_null() {
            match mapping {
                CollectionMapping::Inverse { mapped_by } => {
                    let column = target_type
                        .property_named(mapped_by)
                        .map_or(mapped_by, |p| p.column);
                    let rows = self
                        .executor
                        .select_by_column(&target_type, column, &owner_id)
                        .map_err(|e| {
                            Error::from_sql(ActionKind::Load, target_type.name, None, e)
                        })?;
                    for row in rows {
                        let id = row.get(target_type.id_column).cloned().unwrap_or(Value::Null);
                        let key = EntityKey::new(target_type.name, id);
                        let element = match self.state.identity_map.get(&key).cloned() {
                            Some(existing) => existing,
                            None => self.materialize(&target_type, &row, EntityStatus::Managed)?,
                        };
                        if self
                            .state
                            .entries
                            .status(element.instance_id())
                            .is_some_and(EntityStatus::is_live)
                        {
                            elements.push(element);
                        }
                    }
                }
                CollectionMapping::LinkTable(link) => {
                    let ids = self.executor.select_links(&link, &owner_id).map_err(|e| {
                        Error::from_sql(ActionKind::Load, descriptor.name, Some(owner_id.clone()), e)
                    })?;
                    for id in ids {
                        if let Some(element) = self.find(target_type.name, id, false)? {
                            elements.push(element);
                        }
                    }
                }
            }
        }

        if let Some(collection) = owner.write().collection_at_mut(property) {
            collection.initialize(elements.clone());
        }
        self.state.collections.track(
            owner.instance_id(),
            property,
            role(&descriptor, property),
            Some(elements.clone()),
        );
        tracing::debug!(
            role = %role(&descriptor, property),
            owner = %owner.instance_id(),
            elements = elements.len(),
            "Collection initialized"
        );
        Ok(elements)
    }

    // ==================== Persist ====================

    /// Make one instance managed. `rescue` cancels a scheduled deletion.
    pub fn persist_one(&mut self, entity: &EntityRef, rescue: bool) -> Result<()> {
        match self.state.entries.status(entity.instance_id()) {
            Some(EntityStatus::Managed | EntityStatus::ReadOnly | EntityStatus::Gone) => Ok(()),
            Some(EntityStatus::Deleted) => {
                if rescue {
                    if let Some(entry) = self.state.entries.get_mut(entity.instance_id()) {
                        entry.status = EntityStatus::Managed;
                    }
                    let instance = entity.instance_id();
                    self.state
                        .delete_hints
                        .retain(|(a, b)| *a != instance && *b != instance);
                    tracing::debug!(entity = ?entity, "Scheduled deletion cancelled");
                }
                Ok(())
            }
            None => {
                let (descriptor, id) = {
                    let guard = entity.read();
                    (guard.descriptor().clone(), guard.id().clone())
                };
                match descriptor.id_generation {
                    IdGeneration::Generated if !id.is_null() => Err(Error::DetachedInstance {
                        entity_type: descriptor.name,
                        id,
                    }),
                    IdGeneration::Assigned if id.is_null() => Err(Error::NullIdentifier {
                        entity_type: descriptor.name,
                    }),
                    _ => self.register_new(entity),
                }
            }
        }
    }

    /// Persist `root` and everything reachable through PERSIST cascades.
    #[tracing::instrument(level = "debug", skip(self, root), fields(root = ?root))]
    pub fn persist_graph(&mut self, root: &EntityRef) -> Result<()> {
        if self.state.entries.status(root.instance_id()) == Some(EntityStatus::Gone) {
            return Err(Error::ObjectDeleted {
                entity_type: root.entity_type(),
                id: root.id(),
            });
        }
        let outcome = cascade::cascade(CascadeOp::Persist, std::slice::from_ref(root), self)?;
        for target in &outcome.targets {
            self.persist_one(&target.instance, true)?;
        }
        Ok(())
    }

    // ==================== Remove ====================

    /// Schedule `root` and everything reachable through REMOVE cascades for
    /// deletion.
    #[tracing::instrument(level = "debug", skip(self, root), fields(root = ?root))]
    pub fn remove_graph(&mut self, root: &EntityRef) -> Result<()> {
        match self.state.entries.status(root.instance_id()) {
            None => {
                return Err(Error::NotManaged {
                    entity_type: root.entity_type(),
                });
            }
            Some(EntityStatus::Deleted | EntityStatus::Gone) => return Ok(()),
            Some(EntityStatus::Managed | EntityStatus::ReadOnly) => {}
        }

        let outcome = cascade::cascade(CascadeOp::Remove, std::slice::from_ref(root), self)?;
        for target in &outcome.targets {
            let instance = target.instance.instance_id();
            let Some(entry) = self.state.entries.get_mut(instance) else {
                tracing::trace!(entity = ?target.instance, "Remove cascade reached a transient instance");
                continue;
            };
            if entry.exists_in_database {
                entry.status = EntityStatus::Deleted;
                if let Some(edge) = target.via.filter(|e| e.to_many) {
                    self.state.delete_hints.push((instance, edge.from));
                }
                tracing::debug!(entity = ?target.instance, "Instance scheduled for delete");
            } else {
                tracing::debug!(entity = ?target.instance, "Unsaved instance removed");
                self.state.detach(instance);
            }
        }
        Ok(())
    }

    // ==================== Merge ====================

    /// Copy the state of `source`, and of everything it reaches through
    /// MERGE cascades, onto managed counterparts.
    ///
    /// Targets are resolved breadth-first before any state is copied, so a
    /// failed lookup leaves managed instances untouched.
    #[tracing::instrument(level = "debug", skip(self, source), fields(source = ?source))]
    pub fn merge_graph(&mut self, source: &EntityRef) -> Result<EntityRef> {
        let mut copies: HashMap<InstanceId, EntityRef> = HashMap::new();
        let mut pairs: Vec<(EntityRef, EntityRef)> = Vec::new();
        let mut fresh: Vec<EntityRef> = Vec::new();
        let mut queue: VecDeque<EntityRef> = VecDeque::from([source.clone()]);

        while let Some(next) = queue.pop_front() {
            if copies.contains_key(&next.instance_id()) {
                continue;
            }
            let (target, created) = self.merge_target(&next)?;
            copies.insert(next.instance_id(), target.clone());
            if created {
                fresh.push(target.clone());
            }
            queue.extend(
                merge_cascade_targets(&next)
                    .into_iter()
                    .filter(|t| !copies.contains_key(&t.instance_id())),
            );
            pairs.push((next, target));
        }

        for (from, to) in &pairs {
            self.copy_state(from, to, &copies)?;
        }
        // Deepest first, so referenced copies are queued before referrers.
        for entity in fresh.iter().rev() {
            self.persist_one(entity, false)?;
        }
        tracing::debug!(merged = pairs.len(), created = fresh.len(), "Merge complete");

        copies
            .get(&source.instance_id())
            .cloned()
            .ok_or_else(|| Error::NotManaged {
                entity_type: source.entity_type(),
            })
    }

    /// The instance `source` merges into, and whether it was created here.
    fn merge_target(&mut self, source: &EntityRef) -> Result<(EntityRef, bool)> {
        let (descriptor, id, version) = {
            let guard = source.read();
            (guard.descriptor().clone(), guard.id().clone(), guard.version().clone())
        };
        let deleted = || Error::ObjectDeleted {
            entity_type: descriptor.name,
            id: id.clone(),
        };

        match self.state.entries.status(source.instance_id()) {
            Some(EntityStatus::Managed | EntityStatus::ReadOnly) => return Ok((source.clone(), false)),
            Some(EntityStatus::Deleted | EntityStatus::Gone) => return Err(deleted()),
            None if id.is_null() => {
                return Ok((EntityRef::new(Entity::new(descriptor.clone())), true));
            }
            None => {}
        }

        let key = EntityKey::new(descriptor.name, id.clone());
        let existing = match self.state.identity_map.get(&key).cloned() {
            Some(managed) => {
                if !self
                    .state
                    .entries
                    .status(managed.instance_id())
                    .is_some_and(EntityStatus::is_live)
                {
                    return Err(deleted());
                }
                Some(managed)
            }
            None => self.find(descriptor.name, id.clone(), false)?,
        };
        match existing {
            Some(managed) => {
                let current = managed.read().version().clone();
                if descriptor.is_versioned() && !version.is_null() && version != current {
                    tracing::debug!(key = %key, "Merge of stale detached state");
                    return Err(Error::StaleState {
                        entity_type: descriptor.name,
                        id,
                        action: ActionKind::EntityUpdate,
                    });
                }
                Ok((managed, false))
            }
            None if descriptor.is_versioned() => Err(Error::StaleState {
                entity_type: descriptor.name,
                id,
                action: ActionKind::EntityUpdate,
            }),
            None => {
                let created = EntityRef::new(Entity::new(descriptor.clone()));
                if descriptor.id_generation == IdGeneration::Assigned {
                    created.write().set_id(id);
                }
                Ok((created, true))
            }
        }
    }

    /// Copy property values, pointing associations at the copies made by
    /// this merge, or else at their managed counterparts.
    fn copy_state(
        &self,
        source: &EntityRef,
        target: &EntityRef,
        copies: &HashMap<InstanceId, EntityRef>,
    ) -> Result<()> {
        let (descriptor, values) = {
            let guard = source.read();
            (guard.descriptor().clone(), guard.values().to_vec())
        };
        let resolve = |instance: &EntityRef| match copies.get(&instance.instance_id()) {
            Some(copy) => copy.clone(),
            None => self.managed_counterpart(instance),
        };
        for (index, value) in values.into_iter().enumerate() {
            let Some(property) = descriptor.property_at(index).copied() else {
                continue;
            };
            let copied = match value {
                PropertyValue::Reference(Reference::Loaded(t)) => {
                    PropertyValue::Reference(Reference::Loaded(resolve(&t)))
                }
                PropertyValue::Reference(Reference::Unloaded(key)) => {
                    PropertyValue::Reference(match self.state.identity_map.get(&key) {
                        Some(managed) => Reference::Loaded(managed.clone()),
                        None => Reference::Unloaded(key),
                    })
                }
                PropertyValue::Collection(collection) => {
                    if !collection.is_initialized() {
                        continue;
                    }
                    let elements: Vec<EntityRef> =
                        collection.iter().map(&resolve).collect();
                    let same = target
                        .read()
                        .collection(property.name)
                        .is_some_and(|c| {
                            c.is_initialized()
                                && c.len() == elements.len()
                                && c.iter().zip(&elements).all(|(a, b)| a.ptr_eq(b))
                        });
                    if same {
                        continue;
                    }
                    if let Some(c) = target.write().collection_at_mut(index) {
                        c.replace(elements);
                    }
                    continue;
                }
                other => other,
            };
            if source.ptr_eq(target) && property.kind == PropertyKind::Basic {
                continue;
            }
            target.write().set_value_at(index, copied)?;
        }
        Ok(())
    }

    /// The managed instance for `instance`'s key, or `instance` itself.
    fn managed_counterpart(&self, instance: &EntityRef) -> EntityRef {
        if self.state.entries.contains(instance.instance_id()) {
            return instance.clone();
        }
        instance
            .key()
            .and_then(|key| self.state.identity_map.get(&key).cloned())
            .unwrap_or_else(|| instance.clone())
    }

    // ==================== Refresh ====================

    fn require_persistent(&self, entity: &EntityRef) -> Result<()> {
        match self.state.entries.get(entity.instance_id()) {
            None => Err(Error::NotManaged {
                entity_type: entity.entity_type(),
            }),
            Some(entry) if !entry.status().is_live() => Err(Error::ObjectDeleted {
                entity_type: entity.entity_type(),
                id: entity.id(),
            }),
            Some(entry) if !entry.exists_in_database() => Err(Error::NotManaged {
                entity_type: entity.entity_type(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Re-read `root` and its REFRESH cascade from the database.
    #[tracing::instrument(level = "debug", skip(self, root), fields(root = ?root))]
    pub fn refresh_graph(&mut self, root: &EntityRef) -> Result<()> {
        self.require_persistent(root)?;
        let outcome = cascade::cascade(CascadeOp::Refresh, std::slice::from_ref(root), self)?;
        for target in &outcome.targets {
            let persistent = self
                .state
                .entries
                .get(target.instance.instance_id())
                .is_some_and(|e| e.status().is_live() && e.exists_in_database());
            if persistent {
                self.refresh_one(&target.instance)?;
            }
        }
        Ok(())
    }

    fn refresh_one(&mut self, entity: &EntityRef) -> Result<()> {
        let (descriptor, id) = {
            let guard = entity.read();
            (guard.descriptor().clone(), guard.id().clone())
        };
        let row = self
            .executor
            .select_by_id(&descriptor, &id)
            .map_err(|e| Error::from_sql(ActionKind::Load, descriptor.name, Some(id.clone()), e))?
            .ok_or_else(|| Error::ObjectDeleted {
                entity_type: descriptor.name,
                id: id.clone(),
            })?;
        let state = hydrate::hydrate(&descriptor, &row, &self.state.identity_map)?;
        hydrate::apply(entity, state)?;

        let values = entity.values();
        let version = entity.read().version().clone();
        if let Some(entry) = self.state.entries.get_mut(entity.instance_id()) {
            if entry.status == EntityStatus::Managed {
                entry.loaded_state = Some(Snapshot::capture(&values));
            }
            if descriptor.is_versioned() {
                entry.version = Some(version);
            }
        }
        self.track_collections(entity, true);
        if let Some(key) = entity.key() {
            self.cache_put(&key, entity);
        }
        tracing::debug!(entity = ?entity, "Refreshed");
        Ok(())
    }

    // ==================== Lock ====================

    /// Apply `mode` to `root` and its LOCK cascade.
    #[tracing::instrument(level = "debug", skip(self, root), fields(root = ?root))]
    pub fn lock_graph(&mut self, root: &EntityRef, mode: LockMode) -> Result<()> {
        match self.state.entries.status(root.instance_id()) {
            None => {
                return Err(Error::NotManaged {
                    entity_type: root.entity_type(),
                });
            }
            Some(EntityStatus::Deleted | EntityStatus::Gone) => {
                return Err(Error::ObjectDeleted {
                    entity_type: root.entity_type(),
                    id: root.id(),
                });
            }
            Some(_) => {}
        }
        let outcome = cascade::cascade(CascadeOp::Lock, std::slice::from_ref(root), self)?;
        for target in &outcome.targets {
            if self
                .state
                .entries
                .status(target.instance.instance_id())
                .is_some_and(EntityStatus::is_live)
            {
                self.lock_one(&target.instance, mode)?;
            }
        }
        Ok(())
    }

    fn lock_one(&mut self, entity: &EntityRef, mode: LockMode) -> Result<()> {
        let instance = entity.instance_id();
        let (descriptor, id) = {
            let guard = entity.read();
            (guard.descriptor().clone(), guard.id().clone())
        };
        let Some(entry) = self.state.entries.get(instance) else {
            return Ok(());
        };
        let exists = entry.exists_in_database();
        let expected = entry.version().cloned();

        if mode.is_optimistic() && !descriptor.is_versioned() {
            return Err(Error::InvalidMetadata(format!(
                "{}: optimistic lock modes require a version column",
                descriptor.name
            )));
        }

        if exists {
            let row = match mode {
                LockMode::PessimisticRead | LockMode::PessimisticWrite => {
                    tracing::debug!(entity = ?entity, mode = ?mode, "Acquiring row lock");
                    let row = self
                        .executor
                        .select_for_lock(&descriptor, &id, mode, self.config.lock_timeout())
                        .map_err(|e| Error::from_lock_failure(descriptor.name, id.clone(), mode, e))?;
                    Some(row)
                }
                LockMode::Read | LockMode::Write
                    if descriptor.is_versioned() && mode.greater_than(entry.lock_mode()) =>
                {
                    let row = self.executor.select_by_id(&descriptor, &id).map_err(|e| {
                        Error::from_sql(ActionKind::Lock, descriptor.name, Some(id.clone()), e)
                    })?;
                    Some(row)
                }
                _ => None,
            };
            if let Some(row) = row {
                let Some(row) = row else {
                    return Err(Error::ObjectDeleted {
                        entity_type: descriptor.name,
                        id,
                    });
                };
                if let (Some(column), Some(expected)) = (descriptor.version_column, &expected) {
                    let current = row.get(column).cloned().unwrap_or(Value::Null);
                    if current != *expected {
                        tracing::debug!(entity = ?entity, "Version changed before lock");
                        return Err(Error::StaleState {
                            entity_type: descriptor.name,
                            id,
                            action: ActionKind::Lock,
                        });
                    }
                }
            }
        }

        if let Some(entry) = self.state.entries.get_mut(instance) {
            entry.upgrade_lock(mode);
        }
        Ok(())
    }
}

/// Instances `entity` reaches through associations that cascade MERGE.
fn merge_cascade_targets(entity: &EntityRef) -> Vec<EntityRef> {
    let guard = entity.read();
    let mut targets = Vec::new();
    for (index, property) in guard.descriptor().properties().iter().enumerate() {
        if !property.cascades(CascadeOp::Merge) {
            continue;
        }
        match guard.value_at(index) {
            Some(PropertyValue::Reference(Reference::Loaded(target))) => targets.push(target.clone()),
            Some(PropertyValue::Collection(collection)) if collection.is_initialized() => {
                targets.extend(collection.iter().cloned());
            }
            _ => {}
        }
    }
    targets
}

impl<E: SqlExecutor> AssociationLoader for Engine<'_, E> {
    fn status_of(&self, instance: InstanceId) -> Option<EntityStatus> {
        self.state.entries.status(instance)
    }

    fn load_reference(&mut self, owner: &EntityRef, property: usize) -> Result<Option<EntityRef>> {
        Engine::load_reference(self, owner, property)
    }

    fn initialize_collection(&mut self, owner: &EntityRef, property: usize) -> Result<Vec<EntityRef>> {
        Engine::initialize_collection(self, owner, property)
    }
}
