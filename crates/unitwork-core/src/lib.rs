//! Core types and traits for the unitwork persistence engine.
//!
//! This crate provides the foundation the unit-of-work engine builds on:
//!
//! - `Value` for dynamically typed SQL values
//! - `EntityKey`, `CollectionKey` and `InstanceId` for row and object identity
//! - `Entity` / `EntityRef` dynamic records with explicit association types
//! - `EntityType` / `PropertyInfo` metadata and the `MetadataModel` trait
//! - `SqlExecutor`, the synchronous SQL-execution facade contract
//! - `CacheRegion`, the second-level cache contract
//! - `Error` and `Result`

pub mod cache;
pub mod entity;
pub mod error;
pub mod executor;
pub mod key;
pub mod metadata;
pub mod value;

pub use cache::{CacheRegion, CacheStats, MapCacheRegion};
pub use entity::{
    Entity, EntityCollection, EntityReadGuard, EntityRef, EntityWriteGuard, PropertyValue,
    Reference,
};
pub use error::{ActionKind, Error, Result, SqlError, SqlErrorKind};
pub use executor::{ColumnValues, GeneratedValues, LockMode, Row, SqlExecutor, SqlResult};
pub use key::{CollectionKey, EntityKey, InstanceId};
pub use metadata::{
    CascadeOp, CascadeStyle, CollectionMapping, EntityType, IdGeneration, LinkTable,
    MetadataModel, MetadataRegistry, PropertyInfo, PropertyKind,
};
pub use value::Value;
