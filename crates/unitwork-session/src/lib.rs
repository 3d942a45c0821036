//! Unit-of-work engine for unitwork.
//!
//! `unitwork-session` keeps track of every instance loaded or created during
//! one unit of work and writes their changes back in a single, dependency
//! ordered flush.
//!
//! # Design Philosophy
//!
//! - **One row, one object**: the identity map guarantees at most one
//!   managed instance per [`EntityKey`](unitwork_core::EntityKey).
//! - **Snapshot dirty checking**: no change is registered by hand; a flush
//!   compares each managed instance with the values last synchronized.
//! - **Ordered writes**: inserts wait for the rows they reference, deletes
//!   run children first, and foreign key cycles are split into an insert
//!   with NULL and a post-insert update.
//! - **Fail fast**: every violation found before execution aborts the flush
//!   with no statement executed.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = PersistenceContext::new(metadata, executor);
//!
//! let person = ctx.instantiate("Person")?;
//! person.write().set("name", "Ada")?;
//! ctx.persist(&person)?;
//!
//! let result = ctx.flush()?; // INSERT INTO person ...
//! assert_eq!(result.inserted, 1);
//! ```

pub mod action;
pub mod action_queue;
pub mod cascade;
pub mod collection;
pub mod config;
pub mod context;
pub mod dirty;
mod engine;
pub mod entry;
pub mod events;
pub mod flush;
pub mod hydrate;
pub mod identity_map;
pub mod snapshot;

#[cfg(test)]
mod testing;

pub use action::{Action, ForeignKeyHint, UpdateKind};
pub use action_queue::{ActionCounts, ActionQueue, ExecutionPlan};
pub use cascade::{AssociationLoader, CascadeOutcome, cascade};
pub use collection::{CollectionEntries, CollectionEntry};
pub use config::{CacheMode, FlushMode, SessionConfig};
pub use context::{ContextDebugInfo, PersistenceContext};
pub use dirty::{PropertyChangeVector, compute_dirty};
pub use entry::{EntityEntries, EntityEntry, EntityStatus};
pub use events::{SessionEvent, SessionEventCallbacks};
pub use flush::{FlushResult, FlushState};
pub use identity_map::IdentityMap;
pub use snapshot::Snapshot;
