//! unitwork - a unit-of-work persistence engine.
//!
//! unitwork tracks domain objects across one logical unit of work and
//! writes their changes back to a relational database in a single,
//! correctly ordered flush:
//!
//! - Identity map: one managed instance per row
//! - Snapshot dirty checking with no-op update elision
//! - Cascades over cyclic object graphs
//! - Foreign key aware action ordering, with insert + update splitting for
//!   mutual references
//! - Optimistic (version column) and pessimistic (row lock) concurrency
//! - An injected second-level cache region
//!
//! SQL rendering is left to a [`SqlExecutor`] implementation. The
//! `memory` feature (on by default) provides [`MemoryDatabase`], an
//! in-process store with real constraint and lock behavior.
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! let mut registry = MetadataRegistry::new();
//! registry.register(
//!     EntityType::new("Person", "person")
//!         .versioned("version")
//!         .property(PropertyInfo::basic("name").nullable(false)),
//! )?;
//! let metadata = registry.build()?;
//!
//! let db = MemoryDatabase::new(metadata.as_ref());
//! let factory = SessionFactory::builder().metadata(metadata).build()?;
//! let mut ctx = factory.open(db.connect());
//!
//! let ada = ctx.instantiate("Person")?;
//! ada.write().set("name", "Ada")?;
//! ctx.persist(&ada)?;
//! ctx.flush()?; // INSERT INTO person (version, name)
//!
//! ada.write().set("name", "Ada L.")?;
//! ctx.flush()?; // UPDATE person SET name = ?, version = ? WHERE id = ? AND version = ?
//! ```

pub use unitwork_core::{
    ActionKind, CacheRegion, CacheStats, CascadeOp, CascadeStyle, CollectionKey,
    CollectionMapping, ColumnValues, Entity, EntityCollection, EntityKey, EntityReadGuard,
    EntityRef, EntityType, EntityWriteGuard, Error, GeneratedValues, IdGeneration, InstanceId,
    LinkTable, LockMode, MapCacheRegion, MetadataModel, MetadataRegistry, PropertyInfo,
    PropertyKind, PropertyValue, Reference, Result, Row, SqlError, SqlErrorKind, SqlExecutor,
    SqlResult, Value,
};

pub use unitwork_session::{
    Action, ActionCounts, ActionQueue, CacheMode, CollectionEntry, ContextDebugInfo,
    EntityEntry, EntityStatus, ExecutionPlan, FlushMode, FlushResult, FlushState,
    PersistenceContext, SessionConfig, UpdateKind,
};

#[cfg(feature = "memory")]
pub use unitwork_memory::{MemoryConnection, MemoryDatabase};

pub mod session;
pub use session::{SessionFactory, SessionFactoryBuilder};

/// Everything needed to map entities and run a unit of work.
pub mod prelude {
    pub use crate::{
        // Metadata
        CascadeStyle,
        EntityType,
        IdGeneration,
        LinkTable,
        MetadataModel,
        MetadataRegistry,
        PropertyInfo,
        // Instances
        EntityKey,
        EntityRef,
        Reference,
        Value,
        // Unit of work
        EntityStatus,
        Error,
        FlushMode,
        FlushResult,
        LockMode,
        PersistenceContext,
        Result,
        SessionConfig,
        SessionFactory,
        SqlExecutor,
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryConnection, MemoryDatabase};
}
