//! SQL-execution facade contract.
//!
//! The engine never renders SQL. Every statement it needs goes through a
//! [`SqlExecutor`], which the surrounding framework implements on top of a
//! real driver. Calls are synchronous: the flush does not move on until the
//! previous statement reported success, failure or its affected-row count.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SqlError;
use crate::metadata::{EntityType, LinkTable};
use crate::value::Value;

/// Result of a facade call.
pub type SqlResult<T> = std::result::Result<T, SqlError>;

/// Column/value pairs written by an insert or update.
pub type ColumnValues = Vec<(&'static str, Value)>;

/// Concurrency mode held on an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock.
    #[default]
    None,
    /// Read from the database in this unit of work.
    Read,
    /// Written by this unit of work.
    Write,
    /// Verify the version before the unit of work ends.
    Optimistic,
    /// Increment the version at flush even without changes.
    OptimisticForceIncrement,
    /// Shared row lock (`FOR SHARE`).
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`).
    PessimisticWrite,
}

impl LockMode {
    /// Relative strength; a weaker request never downgrades a held mode.
    pub const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Optimistic => 2,
            LockMode::OptimisticForceIncrement => 3,
            LockMode::Write => 4,
            LockMode::PessimisticRead => 5,
            LockMode::PessimisticWrite => 6,
        }
    }

    pub const fn is_pessimistic(self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }

    pub const fn is_optimistic(self) -> bool {
        matches!(self, LockMode::Optimistic | LockMode::OptimisticForceIncrement)
    }

    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }
}

/// A row read back from the database, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns<I, K>(columns: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Column value; missing columns read as `None`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Values generated by the database for an inserted row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedValues {
    /// Generated identifier, for types with generated ids.
    pub id: Option<Value>,
    /// Version written by the database, when it assigns one.
    pub version: Option<Value>,
}

impl GeneratedValues {
    pub fn with_id(id: impl Into<Value>) -> Self {
        Self {
            id: Some(id.into()),
            version: None,
        }
    }
}

/// Synchronous SQL-execution facade.
///
/// Implementations translate each call into a statement for their dialect
/// and classify failures with a vendor-neutral
/// [`SqlErrorKind`](crate::SqlErrorKind).
pub trait SqlExecutor {
    /// Insert one row, returning generated values.
    fn insert(&self, entity_type: &EntityType, values: &[(&'static str, Value)])
    -> SqlResult<GeneratedValues>;

    /// Update the row with `id`, returning the affected-row count.
    ///
    /// When `expected_version` is given it is part of the predicate, so a
    /// concurrently modified row reports zero affected rows.
    fn update(
        &self,
        entity_type: &EntityType,
        id: &Value,
        changes: &[(&'static str, Value)],
        expected_version: Option<&Value>,
    ) -> SqlResult<u64>;

    /// Delete the row with `id`, returning the affected-row count.
    fn delete(
        &self,
        entity_type: &EntityType,
        id: &Value,
        expected_version: Option<&Value>,
    ) -> SqlResult<u64>;

    /// Plain read by identifier.
    fn select_by_id(&self, entity_type: &EntityType, id: &Value) -> SqlResult<Option<Row>>;

    /// Locking read of the current row.
    fn select_for_lock(
        &self,
        entity_type: &EntityType,
        id: &Value,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> SqlResult<Option<Row>>;

    /// Rows whose `column` equals `value`; loads inverse collections.
    fn select_by_column(
        &self,
        entity_type: &EntityType,
        column: &str,
        value: &Value,
    ) -> SqlResult<Vec<Row>>;

    /// Insert one link row per element.
    fn insert_links(&self, link: &LinkTable, owner: &Value, elements: &[Value]) -> SqlResult<u64>;

    /// Delete link rows of `owner`; all of them when `elements` is `None`.
    fn delete_links(
        &self,
        link: &LinkTable,
        owner: &Value,
        elements: Option<&[Value]>,
    ) -> SqlResult<u64>;

    /// Element identifiers linked to `owner`, in link insertion order.
    fn select_links(&self, link: &LinkTable, owner: &Value) -> SqlResult<Vec<Value>>;
}
