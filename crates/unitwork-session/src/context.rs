//! The persistence context: public unit-of-work API.

use std::sync::Arc;

use unitwork_core::{
    CacheRegion, CascadeOp, EntityKey, EntityRef, Error, InstanceId, LockMode, MetadataModel,
    Result, SqlExecutor, Value,
};

use crate::cascade::{self, AssociationLoader};
use crate::collection::CollectionEntry;
use crate::config::{FlushMode, SessionConfig};
use crate::dirty::compute_dirty;
use crate::engine::{ContextState, Engine};
use crate::entry::{EntityEntries, EntityEntry, EntityStatus};
use crate::events::{SessionEvent, SessionEventCallbacks};
use crate::flush::{FlushResult, FlushState};
use crate::snapshot::Snapshot;

/// Tracks every instance loaded or created during one unit of work and
/// synchronizes their changes with the database on flush.
///
/// A context is used from one thread at a time. Contexts share nothing but
/// the metadata model, the cache region and the database.
pub struct PersistenceContext<E: SqlExecutor> {
    metadata: Arc<dyn MetadataModel>,
    executor: E,
    cache: Option<Arc<dyn CacheRegion>>,
    config: SessionConfig,
    state: ContextState,
    event_callbacks: SessionEventCallbacks,
    closed: bool,
}

impl<E: SqlExecutor> PersistenceContext<E> {
    /// Create a context with default configuration.
    pub fn new(metadata: Arc<dyn MetadataModel>, executor: E) -> Self {
        Self::with_config(metadata, executor, SessionConfig::default())
    }

    /// Create a context with custom configuration.
    pub fn with_config(metadata: Arc<dyn MetadataModel>, executor: E, config: SessionConfig) -> Self {
        Self {
            metadata,
            executor,
            cache: None,
            config,
            state: ContextState::default(),
            event_callbacks: SessionEventCallbacks::default(),
            closed: false,
        }
    }

    /// Attach a second-level cache region.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheRegion>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataModel> {
        &self.metadata
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks
            .register(SessionEvent::BeforeFlush, Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks
            .register(SessionEvent::AfterFlush, Box::new(f));
    }

    // ========================================================================
    // Unit of Work
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ContextClosed)
        } else {
            Ok(())
        }
    }

    fn engine(&mut self) -> Engine<'_, E> {
        Engine {
            metadata: self.metadata.as_ref(),
            executor: &self.executor,
            cache: self.cache.as_deref(),
            config: &self.config,
            state: &mut self.state,
        }
    }

    fn failed(&mut self, error: Error) -> Error {
        self.state.flush_state = FlushState::Failed;
        tracing::warn!(error = %error, "Flush failed");
        error
    }

    fn property_index(entity: &EntityRef, property: &str) -> Result<usize> {
        entity
            .read()
            .descriptor()
            .property_index(property)
            .ok_or_else(|| Error::UnknownProperty {
                entity_type: entity.entity_type(),
                property: property.to_string(),
            })
    }

    /// Create a transient instance of a registered entity type.
    pub fn instantiate(&self, entity_type: &str) -> Result<EntityRef> {
        self.metadata.instantiate(entity_type)
    }

    /// Make a transient instance managed, cascading PERSIST.
    ///
    /// The insert happens at the next flush. Persisting an instance
    /// scheduled for deletion cancels the deletion.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.metadata.require(entity.entity_type())?;
        self.engine().persist_graph(entity)
    }

    /// Schedule a managed instance for deletion, cascading REMOVE.
    ///
    /// An instance that was never inserted is simply forgotten.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.engine().remove_graph(entity)
    }

    /// Copy the state of a detached or transient instance onto the managed
    /// instance with the same key, cascading MERGE.
    ///
    /// Returns the managed instance; `entity` itself stays unmanaged unless
    /// it already was managed.
    pub fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        self.ensure_open()?;
        self.metadata.require(entity.entity_type())?;
        self.engine().merge_graph(entity)
    }

    /// Synchronize every pending change with the database.
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.ensure_open()?;
        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;
        let result = self.engine().flush()?;
        self.event_callbacks.fire(SessionEvent::AfterFlush)?;
        Ok(result)
    }

    /// Flush before a query over `entity_types` when pending actions touch
    /// one of them. Only applies under [`FlushMode::Auto`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn auto_flush_if_needed(&mut self, entity_types: &[&str]) -> Result<Option<FlushResult>> {
        self.ensure_open()?;
        if self.config.flush_mode != FlushMode::Auto {
            return Ok(None);
        }

        let prepared = self.engine().prepare();
        let queue = match prepared {
            Ok(queue) => queue,
            Err(e) => return Err(self.failed(e)),
        };
        if !queue.touches(entity_types) {
            self.state.flush_state = FlushState::Idle;
            tracing::debug!(pending = queue.len(), "Auto-flush not needed");
            return Ok(None);
        }

        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;
        let executed = self.engine().execute(queue);
        let result = match executed {
            Ok(result) => result,
            Err(e) => return Err(self.failed(e)),
        };
        self.event_callbacks.fire(SessionEvent::AfterFlush)?;
        Ok(Some(result))
    }

    /// Flush before transaction completion unless the flush mode is
    /// [`FlushMode::Manual`].
    pub fn flush_before_completion(&mut self) -> Result<Option<FlushResult>> {
        self.ensure_open()?;
        match self.config.flush_mode {
            FlushMode::Auto | FlushMode::Commit => self.flush().map(Some),
            FlushMode::Manual => Ok(None),
        }
    }

    /// Whether a flush would execute any statement.
    pub fn is_dirty(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut roots = Vec::new();
        for entry in self.state.entries.iter() {
            match (entry.status(), entry.exists_in_database()) {
                (EntityStatus::Deleted, _) | (EntityStatus::Managed, false) => return Ok(true),
                (EntityStatus::Managed, true) => {
                    if entry.lock_mode() == LockMode::OptimisticForceIncrement {
                        return Ok(true);
                    }
                    let (descriptor, values) = {
                        let guard = entry.entity().read();
                        (guard.descriptor().clone(), guard.values().to_vec())
                    };
                    if !compute_dirty(&descriptor, &values, entry).is_empty() {
                        return Ok(true);
                    }
                    roots.push(entry.entity().clone());
                }
                _ => {}
            }
        }
        let mut view = TrackedStatus(&self.state.entries);
        let outcome = cascade::cascade(CascadeOp::Persist, &roots, &mut view)?;
        Ok(outcome
            .instances()
            .any(|e| !self.state.entries.contains(e.instance_id())))
    }

    /// Whether `entity` is managed (or read-only) in this context.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.state
            .entries
            .status(entity.instance_id())
            .is_some_and(EntityStatus::is_live)
    }

    /// Stop tracking `entity`. Pending changes to it are not flushed.
    pub fn evict(&mut self, entity: &EntityRef) {
        if self.state.entries.contains(entity.instance_id()) {
            tracing::debug!(entity = ?entity, "Evicted");
            self.state.detach(entity.instance_id());
        }
    }

    /// Key of a tracked instance; `None` if untracked or not yet assigned.
    pub fn get_entity_key(&self, entity: &EntityRef) -> Option<EntityKey> {
        let entry = self.state.entries.get(entity.instance_id())?;
        entry.key().cloned().or_else(|| entity.key())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load by identifier: identity map, then second-level cache, then the
    /// database. Returns `None` if no row exists or the instance is
    /// scheduled for deletion.
    pub fn find(&mut self, entity_type: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::NullIdentifier {
                entity_type: self.metadata.require(entity_type)?.name,
            });
        }
        self.engine().find(entity_type, id, false)
    }

    /// Like [`find`](Self::find), but a newly loaded instance is read-only.
    pub fn load_read_only(
        &mut self,
        entity_type: &str,
        id: impl Into<Value>,
    ) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::NullIdentifier {
                entity_type: self.metadata.require(entity_type)?.name,
            });
        }
        self.engine().find(entity_type, id, true)
    }

    /// Resolve a to-one association of a managed owner.
    pub fn load_reference(&mut self, owner: &EntityRef, property: &str) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        if !self.state.entries.contains(owner.instance_id()) {
            return Err(Error::NotManaged {
                entity_type: owner.entity_type(),
            });
        }
        let index = Self::property_index(owner, property)?;
        self.engine().load_reference(owner, index)
    }

    /// Read the elements of a collection of a managed owner.
    pub fn initialize_collection(&mut self, owner: &EntityRef, property: &str) -> Result<Vec<EntityRef>> {
        self.ensure_open()?;
        let index = Self::property_index(owner, property)?;
        self.engine().initialize_collection(owner, index)
    }

    // ========================================================================
    // State and Locking
    // ========================================================================

    /// Re-read `entity` from the database, cascading REFRESH.
    pub fn refresh(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.engine().refresh_graph(entity)
    }

    /// Lock `entity`, cascading LOCK.
    ///
    /// Pessimistic modes issue a locking read immediately. `Optimistic`
    /// re-checks the version at flush, `OptimisticForceIncrement` increments
    /// it at flush even without changes.
    pub fn lock(&mut self, entity: &EntityRef, mode: LockMode) -> Result<()> {
        self.ensure_open()?;
        self.engine().lock_graph(entity, mode)
    }

    /// Switch a persistent instance between managed and read-only.
    ///
    /// Read-only instances are never dirty checked; returning to managed
    /// takes a fresh snapshot of the current values.
    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        let values = entity.values();
        let entry = self
            .state
            .entries
            .get_mut(entity.instance_id())
            .filter(|e| e.exists_in_database())
            .ok_or(Error::NotManaged {
                entity_type: entity.entity_type(),
            })?;
        match (entry.status, read_only) {
            (EntityStatus::Managed, true) => {
                entry.status = EntityStatus::ReadOnly;
                entry.loaded_state = None;
            }
            (EntityStatus::ReadOnly, false) => {
                entry.status = EntityStatus::Managed;
                entry.loaded_state = Some(Snapshot::capture(&values));
            }
            (EntityStatus::Deleted | EntityStatus::Gone, _) => {
                return Err(Error::ObjectDeleted {
                    entity_type: entity.entity_type(),
                    id: entity.id(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_read_only(&self, entity: &EntityRef) -> Result<bool> {
        self.state
            .entries
            .status(entity.instance_id())
            .map(|s| s == EntityStatus::ReadOnly)
            .ok_or(Error::NotManaged {
                entity_type: entity.entity_type(),
            })
    }

    pub fn status(&self, entity: &EntityRef) -> Option<EntityStatus> {
        self.state.entries.status(entity.instance_id())
    }

    pub fn entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.state.entries.get(entity.instance_id())
    }

    /// Tracking entry of a collection property of a managed owner.
    pub fn collection_entry(&self, owner: &EntityRef, property: &str) -> Option<&CollectionEntry> {
        let index = Self::property_index(owner, property).ok()?;
        self.state.collections.get(owner.instance_id(), index)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Detach every instance. The context stays usable.
    pub fn clear(&mut self) {
        tracing::debug!(detached = self.state.entries.len(), "Context cleared");
        self.state.clear();
    }

    /// Detach every instance and reject further use.
    ///
    /// Detached instances keep their last known values and can be merged
    /// into another context.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        tracing::debug!(detached = self.state.entries.len(), "Context closed");
        self.state.clear();
        self.closed = true;
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn flush_state(&self) -> FlushState {
        self.state.flush_state
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Get total tracked instance count.
    pub fn tracked_count(&self) -> usize {
        self.state.entries.len()
    }

    /// Dump context state for debugging.
    pub fn debug_state(&self) -> ContextDebugInfo {
        let mut info = ContextDebugInfo {
            tracked: self.state.entries.len(),
            identity_map: self.state.identity_map.len(),
            collections: self.state.collections.len(),
            flush_state: self.state.flush_state,
            open: !self.closed,
            ..ContextDebugInfo::default()
        };
        for entry in self.state.entries.iter() {
            match (entry.status(), entry.exists_in_database()) {
                (EntityStatus::Managed, false) => info.pending_insert += 1,
                (EntityStatus::Managed, true) => {
                    let (descriptor, values) = {
                        let guard = entry.entity().read();
                        (guard.descriptor().clone(), guard.values().to_vec())
                    };
                    if !compute_dirty(&descriptor, &values, entry).is_empty() {
                        info.pending_dirty += 1;
                    }
                }
                (EntityStatus::ReadOnly, _) => info.read_only += 1,
                (EntityStatus::Deleted, _) => info.pending_delete += 1,
                (EntityStatus::Gone, _) => {}
            }
        }
        info
    }
}

/// Debug information about context state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextDebugInfo {
    /// Total tracked instances.
    pub tracked: usize,
    /// Instances registered by key.
    pub identity_map: usize,
    /// Tracked collections.
    pub collections: usize,
    /// Instances pending INSERT.
    pub pending_insert: usize,
    /// Instances with dirty properties.
    pub pending_dirty: usize,
    /// Instances pending DELETE.
    pub pending_delete: usize,
    pub read_only: usize,
    pub flush_state: FlushState,
    pub open: bool,
}

/// Status lookups for read-only cascade walks. Persist walks never load.
struct TrackedStatus<'a>(&'a EntityEntries);

impl AssociationLoader for TrackedStatus<'_> {
    fn status_of(&self, instance: InstanceId) -> Option<EntityStatus> {
        self.0.status(instance)
    }

    fn load_reference(&mut self, _owner: &EntityRef, _property: usize) -> Result<Option<EntityRef>> {
        Ok(None)
    }

    fn initialize_collection(&mut self, _owner: &EntityRef, _property: usize) -> Result<Vec<EntityRef>> {
        Ok(Vec::new())
    }
}
