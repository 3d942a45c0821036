//! Flush actions.
//!
//! Every database write a flush performs is one [`Action`]. Actions carry
//! the instance they write and the dependency facts the action queue needs
//! to order them; the SQL itself is produced at execution time from the
//! instance's state.

use unitwork_core::{ActionKind, EntityRef, InstanceId, LinkTable};

use crate::dirty::PropertyChangeVector;

/// A foreign key written by an action, pointing at another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKeyHint {
    /// Property index on the referencing instance.
    pub property: usize,
    pub target: InstanceId,
    pub nullable: bool,
    pub updatable: bool,
}

/// Why an update is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Dirty properties found by dirty checking.
    Dirty,
    /// Sets foreign keys inserted as NULL to break a cycle.
    PostInsert,
    /// Clears foreign keys before a delete to break a cycle.
    PreDelete,
    /// Version bump requested by an `OptimisticForceIncrement` lock.
    VersionIncrement,
}

impl UpdateKind {
    /// Whether the update checks and bumps the optimistic-lock version.
    pub const fn is_versioned(self) -> bool {
        matches!(self, UpdateKind::Dirty | UpdateKind::VersionIncrement)
    }
}

#[derive(Debug, Clone)]
pub struct EntityInsertAction {
    pub entity: EntityRef,
    pub references: Vec<ForeignKeyHint>,
    /// Properties inserted as NULL and set by a later post-insert update.
    pub deferred: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct EntityUpdateAction {
    pub entity: EntityRef,
    pub kind: UpdateKind,
    pub changed: PropertyChangeVector,
    /// Targets the changed foreign keys point at after the update.
    pub references: Vec<ForeignKeyHint>,
    /// Targets the changed foreign keys pointed at before the update.
    pub previous_references: Vec<InstanceId>,
}

#[derive(Debug, Clone)]
pub struct EntityDeleteAction {
    pub entity: EntityRef,
    /// Foreign keys held by the row being deleted.
    pub references: Vec<ForeignKeyHint>,
    /// Properties cleared by a pre-delete update.
    pub deferred: Vec<usize>,
}

/// Link-table maintenance for one owned collection.
#[derive(Debug, Clone)]
pub struct CollectionAction {
    pub owner: EntityRef,
    pub property: usize,
    pub role: String,
    pub link: LinkTable,
    pub added: Vec<EntityRef>,
    pub removed: Vec<EntityRef>,
}

/// One unit of database work in a flush.
#[derive(Debug, Clone)]
pub enum Action {
    Insert(EntityInsertAction),
    Update(EntityUpdateAction),
    Delete(EntityDeleteAction),
    /// Write every link row of a new collection.
    CollectionRecreate(CollectionAction),
    /// Apply added/removed link rows.
    CollectionUpdate(CollectionAction),
    /// Delete every link row of a deleted owner.
    CollectionRemove(CollectionAction),
}

impl Action {
    pub const fn kind(&self) -> ActionKind {
        match self {
            Action::Insert(_) => ActionKind::EntityInsert,
            Action::Update(_) => ActionKind::EntityUpdate,
            Action::Delete(_) => ActionKind::EntityDelete,
            Action::CollectionRecreate(_) => ActionKind::CollectionRecreate,
            Action::CollectionUpdate(_) => ActionKind::CollectionUpdate,
            Action::CollectionRemove(_) => ActionKind::CollectionRemove,
        }
    }

    /// Fixed subtype order used when dependencies allow a choice.
    pub const fn rank(&self) -> u8 {
        match self {
            Action::Insert(_) => 0,
            Action::Update(_) => 1,
            Action::CollectionRemove(_) => 2,
            Action::CollectionUpdate(_) => 3,
            Action::CollectionRecreate(_) => 4,
            Action::Delete(_) => 5,
        }
    }

    /// The written instance, or the collection owner.
    pub fn entity(&self) -> &EntityRef {
        match self {
            Action::Insert(a) => &a.entity,
            Action::Update(a) => &a.entity,
            Action::Delete(a) => &a.entity,
            Action::CollectionRecreate(a)
            | Action::CollectionUpdate(a)
            | Action::CollectionRemove(a) => &a.owner,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.entity().instance_id()
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity().entity_type()
    }

    pub const fn is_collection(&self) -> bool {
        matches!(
            self,
            Action::CollectionRecreate(_) | Action::CollectionUpdate(_) | Action::CollectionRemove(_)
        )
    }

    /// Short label for logs and cycle reports, e.g. `insert A@4`.
    pub fn describe(&self) -> String {
        let entity = self.entity();
        match self {
            Action::Update(a) if a.kind == UpdateKind::PostInsert => {
                format!("post-insert update {}{}", entity.entity_type(), entity.instance_id())
            }
            Action::Update(a) if a.kind == UpdateKind::PreDelete => {
                format!("pre-delete update {}{}", entity.entity_type(), entity.instance_id())
            }
            Action::CollectionRecreate(a) | Action::CollectionUpdate(a) | Action::CollectionRemove(a) => {
                format!("{} {}{}", self.kind(), a.role, entity.instance_id())
            }
            _ => format!("{} {}{}", self.kind(), entity.entity_type(), entity.instance_id()),
        }
    }
}
