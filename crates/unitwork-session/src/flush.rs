//! Flush coordinator.
//!
//! A flush runs in phases: cascading persist from every managed instance
//! and scheduling orphans for deletion, dirty checking and action
//! collection, planning, then execution through the SQL executor. Any
//! error before execution leaves the database untouched. An execution error
//! stops the flush at the failing action; earlier actions stay applied and
//! the context reflects them.

use std::time::Instant;

use unitwork_core::{
    ActionKind, CascadeOp, EntityRef, EntityType, Error, InstanceId, LockMode, PropertyValue,
    Reference, Result, SqlExecutor, Value,
};

use crate::action::{
    Action, CollectionAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction,
    ForeignKeyHint, UpdateKind,
};
use crate::action_queue::ActionQueue;
use crate::cascade;
use crate::dirty::compute_dirty;
use crate::engine::{Engine, role};
use crate::entry::EntityStatus;
use crate::hydrate;
use crate::snapshot::{RefSnapshot, Snapshot, SnapshotValue};

/// Phase of the flush coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushState {
    #[default]
    Idle,
    Cascading,
    DirtyChecking,
    Queued,
    Executing,
    Done,
    /// The last flush failed; the next flush starts over.
    Failed,
}

/// Statements executed by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub collections_recreated: usize,
    pub collections_updated: usize,
    pub collections_removed: usize,
    /// Updates setting foreign keys deferred to break a cycle.
    pub post_insert_updates: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.deleted
            + self.collections_recreated
            + self.collections_updated
            + self.collections_removed
            + self.post_insert_updates
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl<E: SqlExecutor> Engine<'_, E> {
    /// Synchronize every pending change with the database.
    #[tracing::instrument(level = "info", skip(self), fields(tracked = self.state.entries.len()))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        let result = self.prepare().and_then(|queue| self.execute(queue));
        if let Err(e) = &result {
            self.state.flush_state = FlushState::Failed;
            tracing::warn!(error = %e, "Flush failed");
        }
        result
    }

    /// Cascade, dirty check and collect the actions of a flush.
    pub fn prepare(&mut self) -> Result<ActionQueue> {
        self.purge_gone();

        self.state.flush_state = FlushState::Cascading;
        self.cascade_persist()?;
        self.remove_orphans()?;

        self.state.flush_state = FlushState::DirtyChecking;
        self.check_references()?;
        let queue = self.collect_actions();

        self.state.flush_state = FlushState::Queued;
        tracing::debug!(counts = ?queue.counts(), "Actions queued");
        Ok(queue)
    }

    /// Plan and run a prepared queue.
    pub fn execute(&mut self, queue: ActionQueue) -> Result<FlushResult> {
        let start = Instant::now();
        let plan = queue.plan()?;

        self.state.flush_state = FlushState::Executing;
        let mut result = FlushResult::default();
        for action in plan.into_actions() {
            tracing::debug!(action = %action.describe(), "Executing");
            match action {
                Action::Insert(insert) => {
                    self.execute_insert(&insert)?;
                    result.inserted += 1;
                }
                Action::Update(update) => {
                    if self.execute_update(&update)? {
                        match update.kind {
                            UpdateKind::PostInsert => result.post_insert_updates += 1,
                            _ => result.updated += 1,
                        }
                    }
                }
                Action::Delete(delete) => {
                    self.execute_delete(&delete)?;
                    result.deleted += 1;
                }
                Action::CollectionRecreate(c) => {
                    self.execute_collection(ActionKind::CollectionRecreate, &c)?;
                    result.collections_recreated += 1;
                }
                Action::CollectionUpdate(c) => {
                    self.execute_collection(ActionKind::CollectionUpdate, &c)?;
                    result.collections_updated += 1;
                }
                Action::CollectionRemove(c) => {
                    self.execute_collection(ActionKind::CollectionRemove, &c)?;
                    result.collections_removed += 1;
                }
            }
        }

        self.verify_optimistic_locks()?;

        self.state.flush_state = FlushState::Done;
        self.finish();
        self.state.flush_state = FlushState::Idle;

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            collections = result.collections_recreated
                + result.collections_updated
                + result.collections_removed,
            post_insert_updates = result.post_insert_updates,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flush complete"
        );
        Ok(result)
    }

    // ==================== Cascading ====================

    fn purge_gone(&mut self) {
        let gone: Vec<InstanceId> = self
            .state
            .entries
            .iter()
            .filter(|e| e.status() == EntityStatus::Gone)
            .map(|e| e.entity().instance_id())
            .collect();
        for instance in gone {
            self.state.detach(instance);
        }
    }

    fn managed_roots(&self) -> Vec<EntityRef> {
        self.state
            .entries
            .ordered_ids()
            .into_iter()
            .filter_map(|id| self.state.entries.get(id))
            .filter(|e| e.status() == EntityStatus::Managed)
            .map(|e| e.entity().clone())
            .collect()
    }

    fn cascade_persist(&mut self) -> Result<()> {
        let roots = self.managed_roots();
        let outcome = cascade::cascade(CascadeOp::Persist, &roots, self)?;
        for target in &outcome.targets {
            self.persist_one(&target.instance, false)?;
        }
        for found in &outcome.transient_references {
            if !found.nullable && !self.state.entries.contains(found.target.instance_id()) {
                return Err(Error::TransientPropertyViolation {
                    entity_type: found.owner.entity_type(),
                    property: found.property,
                    target_type: found.target.entity_type(),
                });
            }
        }
        Ok(())
    }

    /// Instance a recorded reference pointed at, if still tracked.
    fn resolve_snapshot(&self, snapshot: &RefSnapshot) -> Option<EntityRef> {
        if let Some(entry) = snapshot.instance.and_then(|i| self.state.entries.get(i)) {
            return Some(entry.entity().clone());
        }
        snapshot
            .key
            .as_ref()
            .and_then(|key| self.state.identity_map.get(key))
            .cloned()
    }

    fn remove_orphans(&mut self) -> Result<()> {
        let mut orphans: Vec<EntityRef> = Vec::new();
        for id in self.state.entries.ordered_ids() {
            let Some(entry) = self.state.entries.get(id) else {
                continue;
            };
            if entry.status() != EntityStatus::Managed || !entry.exists_in_database() {
                continue;
            }
            let owner = entry.entity().clone();
            let descriptor = owner.read().descriptor().clone();
            let values = owner.values();

            for (index, property) in descriptor.properties().iter().enumerate() {
                if !property.orphan_removal {
                    continue;
                }
                match values.get(index) {
                    Some(PropertyValue::Collection(collection)) if collection.is_initialized() => {
                        if let Some(tracked) = self.state.collections.get(id, index) {
                            if tracked.snapshot().is_some() {
                                let (_, removed) = tracked.diff(collection.elements());
                                orphans.extend(removed);
                            }
                        }
                    }
                    Some(PropertyValue::Reference(current)) => {
                        let before = entry
                            .loaded_state()
                            .and_then(|s| s.get(index))
                            .and_then(SnapshotValue::reference);
                        let Some(before) = before else {
                            continue;
                        };
                        let replaced = RefSnapshot::of(current).is_none_or(|now| !now.same_target(before));
                        if replaced {
                            orphans.extend(self.resolve_snapshot(before));
                        }
                    }
                    _ => {}
                }
            }
        }

        for orphan in orphans {
            if self
                .state
                .entries
                .status(orphan.instance_id())
                .is_some_and(EntityStatus::is_live)
            {
                tracing::debug!(orphan = ?orphan, "Orphan scheduled for delete");
                self.remove_graph(&orphan)?;
            }
        }
        Ok(())
    }

    // ==================== Dirty checking ====================

    fn check_references(&self) -> Result<()> {
        for id in self.state.entries.ordered_ids() {
            let Some(entry) = self.state.entries.get(id) else {
                continue;
            };
            if entry.status() != EntityStatus::Managed {
                continue;
            }
            let inserting = !entry.exists_in_database();
            let (descriptor, values) = {
                let guard = entry.entity().read();
                (guard.descriptor().clone(), guard.values().to_vec())
            };

            for (property, value) in descriptor.properties().iter().zip(&values) {
                match value {
                    PropertyValue::Reference(Reference::Loaded(target)) => {
                        self.check_target(&descriptor, property.name, target)?;
                    }
                    PropertyValue::Collection(collection)
                        if collection.is_initialized() && property.link_table().is_some() =>
                    {
                        for element in collection.iter() {
                            self.check_target(&descriptor, property.name, element)?;
                        }
                    }
                    _ => {}
                }

                let written = if inserting {
                    property.insertable
                } else {
                    property.updatable
                };
                if !self.config.check_nullability || property.nullable || !written {
                    continue;
                }
                let null = match value {
                    PropertyValue::Scalar(v) => v.is_null(),
                    PropertyValue::Reference(r) => r.is_null(),
                    _ => false,
                };
                if null {
                    return Err(Error::NullProperty {
                        entity_type: descriptor.name,
                        property: property.name,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_target(
        &self,
        owner: &EntityType,
        property: &'static str,
        target: &EntityRef,
    ) -> Result<()> {
        if !self.state.entries.contains(target.instance_id()) && target.id().is_null() {
            return Err(Error::TransientPropertyViolation {
                entity_type: owner.name,
                property,
                target_type: target.entity_type(),
            });
        }
        Ok(())
    }

    /// Foreign keys among `properties` that point at loaded instances.
    fn reference_hints(
        descriptor: &EntityType,
        values: &[PropertyValue],
        properties: impl IntoIterator<Item = usize>,
    ) -> Vec<ForeignKeyHint> {
        properties
            .into_iter()
            .filter_map(|index| {
                let property = descriptor.property_at(index)?;
                if !property.has_column() {
                    return None;
                }
                let target = values.get(index)?.as_reference()?.instance()?;
                Some(ForeignKeyHint {
                    property: index,
                    target: target.instance_id(),
                    nullable: property.nullable,
                    updatable: property.updatable,
                })
            })
            .collect()
    }

    fn collect_actions(&self) -> ActionQueue {
        let mut queue = ActionQueue::new(self.config.order_by_table);

        for id in self.state.entries.ordered_ids() {
            let Some(entry) = self.state.entries.get(id) else {
                continue;
            };
            let entity = entry.entity().clone();
            let (descriptor, values) = {
                let guard = entity.read();
                (guard.descriptor().clone(), guard.values().to_vec())
            };

            match (entry.status(), entry.exists_in_database()) {
                (EntityStatus::Managed, false) => {
                    let insertable = descriptor
                        .properties()
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.insertable)
                        .map(|(i, _)| i);
                    queue.add(Action::Insert(EntityInsertAction {
                        entity: entity.clone(),
                        references: Self::reference_hints(&descriptor, &values, insertable),
                        deferred: Vec::new(),
                    }));
                    for (index, value) in values.iter().enumerate() {
                        let Some(link) = descriptor.property_at(index).and_then(|p| p.link_table())
                        else {
                            continue;
                        };
                        let PropertyValue::Collection(collection) = value else {
                            continue;
                        };
                        if collection.is_initialized() && !collection.is_empty() {
                            queue.add(Action::CollectionRecreate(CollectionAction {
                                owner: entity.clone(),
                                property: index,
                                role: role(&descriptor, index),
                                link,
                                added: collection.elements().to_vec(),
                                removed: Vec::new(),
                            }));
                        }
                    }
                }
                (EntityStatus::Managed, true) => {
                    let changed = compute_dirty(&descriptor, &values, entry);
                    let columns: Vec<usize> = changed.columns(&descriptor).collect();
                    let owned_collection_changed = descriptor.is_versioned()
                        && changed.collections(&descriptor).any(|i| {
                            descriptor.property_at(i).is_some_and(|p| !p.is_inverse())
                        });
                    let force = entry.lock_mode() == LockMode::OptimisticForceIncrement;

                    if !columns.is_empty() || owned_collection_changed || force {
                        let previous_references = columns
                            .iter()
                            .filter_map(|&i| entry.loaded_state()?.get(i)?.reference())
                            .filter_map(|r| self.resolve_snapshot(r))
                            .map(|e| e.instance_id())
                            .collect();
                        let kind = if columns.is_empty() && !owned_collection_changed {
                            UpdateKind::VersionIncrement
                        } else {
                            UpdateKind::Dirty
                        };
                        queue.add(Action::Update(EntityUpdateAction {
                            entity: entity.clone(),
                            kind,
                            references: Self::reference_hints(&descriptor, &values, columns),
                            previous_references,
                            changed: changed.clone(),
                        }));
                    }

                    for index in changed.collections(&descriptor) {
                        let Some(link) = descriptor.property_at(index).and_then(|p| p.link_table())
                        else {
                            continue;
                        };
                        let Some(PropertyValue::Collection(collection)) = values.get(index) else {
                            continue;
                        };
                        let action = |added, removed| CollectionAction {
                            owner: entity.clone(),
                            property: index,
                            role: role(&descriptor, index),
                            link,
                            added,
                            removed,
                        };
                        match self.state.collections.get(id, index) {
                            Some(tracked) if tracked.snapshot().is_some() => {
                                let (added, removed) = tracked.diff(collection.elements());
                                if !added.is_empty() || !removed.is_empty() {
                                    queue.add(Action::CollectionUpdate(action(added, removed)));
                                }
                            }
                            _ => {
                                // Replaced without reading: rewrite every link row.
                                queue.add(Action::CollectionRemove(action(Vec::new(), Vec::new())));
                                if !collection.is_empty() {
                                    queue.add(Action::CollectionRecreate(action(
                                        collection.elements().to_vec(),
                                        Vec::new(),
                                    )));
                                }
                            }
                        }
                    }
                }
                (EntityStatus::Deleted, _) => {
                    let loaded = entry.loaded_state();
                    let references = descriptor
                        .properties()
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.has_column() && p.target().is_some())
                        .filter_map(|(index, property)| {
                            let target = match loaded {
                                Some(snapshot) => snapshot
                                    .get(index)
                                    .and_then(SnapshotValue::reference)
                                    .and_then(|r| self.resolve_snapshot(r)),
                                None => values
                                    .get(index)
                                    .and_then(PropertyValue::as_reference)
                                    .and_then(Reference::instance)
                                    .cloned(),
                            }?;
                            Some(ForeignKeyHint {
                                property: index,
                                target: target.instance_id(),
                                nullable: property.nullable,
                                updatable: property.updatable,
                            })
                        })
                        .collect();
                    queue.add(Action::Delete(EntityDeleteAction {
                        entity: entity.clone(),
                        references,
                        deferred: Vec::new(),
                    }));

                    for (index, property) in descriptor.properties().iter().enumerate() {
                        let Some(link) = property.link_table() else {
                            continue;
                        };
                        let removed = match self.state.collections.get(id, index).and_then(|c| c.snapshot()) {
                            Some(elements) => elements.to_vec(),
                            None => values
                                .get(index)
                                .and_then(PropertyValue::as_collection)
                                .map(|c| c.elements().to_vec())
                                .unwrap_or_default(),
                        };
                        queue.add(Action::CollectionRemove(CollectionAction {
                            owner: entity.clone(),
                            property: index,
                            role: role(&descriptor, index),
                            link,
                            added: Vec::new(),
                            removed,
                        }));
                    }
                }
                _ => {}
            }
        }

        for &(first, second) in &self.state.delete_hints {
            queue.add_delete_order_hint(first, second);
        }
        queue
    }

    // ==================== Execution ====================

    fn execute_insert(&mut self, insert: &EntityInsertAction) -> Result<()> {
        let entity = &insert.entity;
        let descriptor = entity.read().descriptor().clone();
        if descriptor.is_versioned() && entity.read().version().is_null() {
            entity.write().set_version(Value::initial_version());
        }

        let columns = hydrate::insert_values(entity, &insert.deferred)?;
        let generated = self.executor.insert(&descriptor, &columns).map_err(|e| {
            let id = entity.id();
            Error::from_sql(
                ActionKind::EntityInsert,
                descriptor.name,
                (!id.is_null()).then_some(id),
                e,
            )
        })?;
        {
            let mut guard = entity.write();
            if let Some(id) = generated.id {
                guard.set_id(id);
            }
            if let Some(version) = generated.version {
                guard.set_version(version);
            }
        }

        let key = entity.key().ok_or(Error::NullIdentifier {
            entity_type: descriptor.name,
        })?;
        self.state.identity_map.put(key.clone(), entity)?;

        let mut snapshot = Snapshot::capture(&entity.values());
        for &index in &insert.deferred {
            snapshot.set(index, SnapshotValue::Reference(None));
        }
        let version = entity.read().version().clone();
        if let Some(entry) = self.state.entries.get_mut(entity.instance_id()) {
            entry.exists_in_database = true;
            entry.key = Some(key.clone());
            entry.loaded_state = Some(snapshot);
            if descriptor.is_versioned() {
                entry.version = Some(version);
            }
        }
        self.cache_put(&key, entity);
        tracing::debug!(key = %key, deferred = insert.deferred.len(), "Inserted");
        Ok(())
    }

    /// Returns `false` when there was nothing to write.
    fn execute_update(&mut self, update: &EntityUpdateAction) -> Result<bool> {
        let entity = &update.entity;
        let (descriptor, id) = {
            let guard = entity.read();
            (guard.descriptor().clone(), guard.id().clone())
        };

        let mut columns = match update.kind {
            UpdateKind::PreDelete => hydrate::null_values(&descriptor, update.changed.indexes()),
            UpdateKind::PostInsert => {
                hydrate::update_values(entity, update.changed.indexes().iter().copied())?
            }
            UpdateKind::Dirty | UpdateKind::VersionIncrement => {
                hydrate::update_values(entity, update.changed.columns(&descriptor))?
            }
        };

        let versioned = descriptor.is_versioned() && update.kind.is_versioned();
        let mut expected = None;
        let mut next = None;
        if versioned {
            let current = self
                .state
                .entries
                .get(entity.instance_id())
                .and_then(|e| e.version().cloned())
                .unwrap_or_else(|| entity.read().version().clone());
            let bumped = current.next_version().ok_or_else(|| {
                Error::InvalidMetadata(format!(
                    "{}: version value {} cannot be incremented",
                    descriptor.name, current
                ))
            })?;
            if let Some(column) = descriptor.version_column {
                columns.push((column, bumped.clone()));
            }
            expected = Some(current);
            next = Some(bumped);
        }
        if columns.is_empty() {
            return Ok(false);
        }

        let rows = self
            .executor
            .update(&descriptor, &id, &columns, expected.as_ref())
            .map_err(|e| {
                Error::from_sql(ActionKind::EntityUpdate, descriptor.name, Some(id.clone()), e)
            })?;
        if rows == 0 {
            tracing::debug!(entity = ?entity, expected = ?expected, "Update matched no row");
            return Err(Error::StaleState {
                entity_type: descriptor.name,
                id,
                action: ActionKind::EntityUpdate,
            });
        }

        if let Some(next) = &next {
            entity.write().set_version(next.clone());
        }
        let values = entity.values();
        if let Some(entry) = self.state.entries.get_mut(entity.instance_id()) {
            if let Some(next) = next {
                entry.version = Some(next);
            }
            if let Some(snapshot) = entry.loaded_state.as_mut() {
                for &index in update.changed.indexes() {
                    let value = match update.kind {
                        UpdateKind::PreDelete => SnapshotValue::Reference(None),
                        _ => match values.get(index) {
                            Some(v) => SnapshotValue::of(v),
                            None => continue,
                        },
                    };
                    snapshot.set(index, value);
                }
            }
        }
        if update.kind != UpdateKind::PreDelete {
            if let Some(key) = entity.key() {
                self.cache_put(&key, entity);
            }
        }
        Ok(true)
    }

    fn execute_delete(&mut self, delete: &EntityDeleteAction) -> Result<()> {
        let entity = &delete.entity;
        let (descriptor, id) = {
            let guard = entity.read();
            (guard.descriptor().clone(), guard.id().clone())
        };
        let expected = if descriptor.is_versioned() {
            self.state
                .entries
                .get(entity.instance_id())
                .and_then(|e| e.version().cloned())
        } else {
            None
        };

        let rows = self
            .executor
            .delete(&descriptor, &id, expected.as_ref())
            .map_err(|e| {
                Error::from_sql(ActionKind::EntityDelete, descriptor.name, Some(id.clone()), e)
            })?;
        if rows == 0 {
            return Err(Error::StaleState {
                entity_type: descriptor.name,
                id,
                action: ActionKind::EntityDelete,
            });
        }

        if let Some(entry) = self.state.entries.get_mut(entity.instance_id()) {
            entry.status = EntityStatus::Gone;
            entry.loaded_state = None;
        }
        if let Some(key) = entity.key() {
            self.cache_evict(&key);
            if self
                .state
                .identity_map
                .get(&key)
                .is_some_and(|r| r.ptr_eq(entity))
            {
                self.state.identity_map.remove(&key);
            }
        }
        tracing::debug!(entity = ?entity, "Deleted");
        Ok(())
    }

    fn execute_collection(&mut self, kind: ActionKind, action: &CollectionAction) -> Result<()> {
        let owner_id = action.owner.id();
        let owner_type = action.owner.entity_type();
        let sql_error = |e| Error::from_sql(kind, owner_type, Some(owner_id.clone()), e);
        let ids = |elements: &[EntityRef]| -> Vec<Value> { elements.iter().map(EntityRef::id).collect() };

        match kind {
            ActionKind::CollectionRemove => {
                self.executor
                    .delete_links(&action.link, &owner_id, None)
                    .map_err(sql_error)?;
            }
            _ => {
                if !action.removed.is_empty() {
                    self.executor
                        .delete_links(&action.link, &owner_id, Some(&ids(&action.removed)))
                        .map_err(sql_error)?;
                }
                if !action.added.is_empty() {
                    self.executor
                        .insert_links(&action.link, &owner_id, &ids(&action.added))
                        .map_err(sql_error)?;
                }
                let current = action
                    .owner
                    .read()
                    .value_at(action.property)
                    .and_then(PropertyValue::as_collection)
                    .map(|c| c.elements().to_vec())
                    .unwrap_or_default();
                self.state
                    .collections
                    .set_snapshot(action.owner.instance_id(), action.property, current);
            }
        }
        tracing::debug!(
            role = %action.role,
            added = action.added.len(),
            removed = action.removed.len(),
            "Link rows written"
        );
        Ok(())
    }

    /// Re-read the version of every instance locked with `Optimistic`.
    fn verify_optimistic_locks(&self) -> Result<()> {
        for entry in self.state.entries.iter() {
            if entry.lock_mode() != LockMode::Optimistic
                || !entry.status().is_live()
                || !entry.exists_in_database()
            {
                continue;
            }
            let (descriptor, id) = {
                let guard = entry.entity().read();
                (guard.descriptor().clone(), guard.id().clone())
            };
            let Some(column) = descriptor.version_column else {
                continue;
            };
            let row = self.executor.select_by_id(&descriptor, &id).map_err(|e| {
                Error::from_sql(ActionKind::Lock, descriptor.name, Some(id.clone()), e)
            })?;
            let current = row.as_ref().and_then(|r| r.get(column));
            if current != entry.version() {
                return Err(Error::StaleState {
                    entity_type: descriptor.name,
                    id,
                    action: ActionKind::Lock,
                });
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.purge_gone();
        self.state.delete_hints.clear();

        let live: Vec<EntityRef> = self
            .state
            .entries
            .iter()
            .filter(|e| e.status().is_live())
            .map(|e| e.entity().clone())
            .collect();
        for entity in live {
            let mut synced: Vec<(usize, Vec<EntityRef>)> = Vec::new();
            {
                let mut guard = entity.write();
                let count = guard.descriptor().properties().len();
                for index in 0..count {
                    if let Some(collection) = guard.collection_at_mut(index) {
                        if collection.is_initialized() {
                            collection.mark_clean();
                            synced.push((index, collection.elements().to_vec()));
                        }
                    }
                }
            }
            for (index, elements) in synced {
                self.state
                    .collections
                    .set_snapshot(entity.instance_id(), index, elements);
            }
            if let Some(entry) = self.state.entries.get_mut(entity.instance_id()) {
                if entry.lock_mode == LockMode::OptimisticForceIncrement {
                    entry.lock_mode = LockMode::Write;
                }
            }
        }
    }
}
