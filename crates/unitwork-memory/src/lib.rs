//! In-memory relational store for unitwork.
//!
//! `unitwork-memory` implements [`SqlExecutor`](unitwork_core::SqlExecutor)
//! over tables held in process memory. It stands in for a real driver in
//! tests and demos and behaves like one where the unit-of-work engine can
//! tell the difference:
//!
//! - generated identifiers per table
//! - version predicates on `UPDATE` and `DELETE`
//! - `NOT NULL`, foreign key and primary key constraints, checked per
//!   statement or deferred until commit
//! - shared and exclusive row locks with NOWAIT or bounded waits
//! - link-table rows for owned collections
//! - a statement log and failure injection
//!
//! # Thread Safety
//!
//! A [`MemoryDatabase`] is a cheap handle to shared state guarded by a
//! mutex. Each [`MemoryConnection`] holds its own row locks and transaction,
//! so two persistence contexts on two connections contend the way they
//! would on a real server.
//!
//! # Example
//!
//! ```ignore
//! let db = MemoryDatabase::new(metadata.as_ref()).with_deferred_constraints(true);
//! let mut ctx = PersistenceContext::new(metadata, db.connect());
//! // ... persist, flush ...
//! ctx.executor().commit()?;
//! ```

pub mod connection;
pub mod database;
pub mod schema;

pub use connection::MemoryConnection;
pub use database::MemoryDatabase;
pub use schema::{ForeignKey, LinkSchema, Schema, TableSchema};
