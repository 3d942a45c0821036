//! Shared store behind every connection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use unitwork_core::{LockMode, MetadataModel, Row, SqlError, SqlErrorKind, SqlResult, Value};

use crate::connection::MemoryConnection;
use crate::schema::{ForeignKey, Schema, TableSchema};

const NOT_NULL_VIOLATION: &str = "23502";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNIQUE_VIOLATION: &str = "23505";

/// Key comparison across integer widths.
fn same_identifier(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::BigInt(y)) | (Value::BigInt(y), Value::Int(x)) => i64::from(*x) == *y,
        _ => a == b,
    }
}

/// Connection identifier; owns row locks and transactions.
pub(crate) type ConnectionId = u64;

#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub rows: Vec<Row>,
    sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RowLock {
    Shared(BTreeSet<ConnectionId>),
    Exclusive(ConnectionId),
}

impl RowLock {
    fn holders(&self) -> Vec<ConnectionId> {
        match self {
            RowLock::Shared(owners) => owners.iter().copied().collect(),
            RowLock::Exclusive(owner) => vec![*owner],
        }
    }

    fn held_only_by(&self, connection: ConnectionId) -> bool {
        self.holders().iter().all(|c| *c == connection)
    }
}

/// Outcome of one attempt to lock a row.
pub(crate) enum LockAttempt {
    Acquired(Option<Row>),
    Blocked(ConnectionId),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<&'static str, Table>,
    links: BTreeMap<&'static str, Vec<(Value, Value)>>,
}

#[derive(Debug)]
struct Failure {
    skip: usize,
    error: SqlError,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    schema: Schema,
    data: Tables,
    locks: HashMap<(&'static str, Value), RowLock>,
    transactions: HashMap<ConnectionId, Tables>,
    log: Vec<String>,
    deferred: bool,
    failure: Option<Failure>,
    next_connection: ConnectionId,
}

fn violation(sqlstate: &str, message: String) -> SqlError {
    SqlError::new(SqlErrorKind::ConstraintViolation, message).with_sqlstate(sqlstate)
}

fn no_such_table(table: &str) -> SqlError {
    SqlError::new(SqlErrorKind::Grammar, format!("no such table: {table}"))
}

impl Store {
    fn table_schema(&self, table: &str) -> SqlResult<&TableSchema> {
        self.schema.table(table).ok_or_else(|| no_such_table(table))
    }

    fn record(&mut self, connection: ConnectionId, sql: String) {
        tracing::trace!(connection, sql = %sql, "Statement");
        self.log.push(sql);
    }

    /// Consume an injected failure once its skip count reaches zero.
    fn take_failure(&mut self) -> Option<SqlError> {
        let failure = self.failure.as_mut()?;
        if failure.skip > 0 {
            failure.skip -= 1;
            return None;
        }
        self.failure.take().map(|f| f.error)
    }

    fn position(&self, table: &str, id_column: &str, id: &Value) -> Option<usize> {
        self.data
            .tables
            .get(table)?
            .rows
            .iter()
            .position(|row| row.get(id_column).is_some_and(|v| same_identifier(v, id)))
    }

    fn exists(&self, key: &ForeignKey, value: &Value) -> bool {
        self.data.tables.get(key.references).is_some_and(|t| {
            t.rows.iter().any(|row| {
                row.get(key.referenced_column)
                    .is_some_and(|v| same_identifier(v, value))
            })
        })
    }

    fn check_row(&self, table: &TableSchema, row: &Row) -> SqlResult<()> {
        for column in &table.not_null {
            if row.get(column).is_none_or(Value::is_null) {
                return Err(violation(
                    NOT_NULL_VIOLATION,
                    format!("NOT NULL constraint failed: {}.{}", table.name, column),
                ));
            }
        }
        for key in &table.foreign_keys {
            let Some(value) = row.get(key.column).filter(|v| !v.is_null()) else {
                continue;
            };
            if !self.exists(key, value) {
                return Err(violation(
                    FOREIGN_KEY_VIOLATION,
                    format!(
                        "FOREIGN KEY constraint failed: {}.{} = {} references missing {}",
                        table.name, key.column, value, key.references
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_link(&self, link: &'static str, owner: &Value, element: &Value) -> SqlResult<()> {
        let Some(schema) = self.schema.link(link) else {
            return Err(no_such_table(link));
        };
        for (key, value) in [(&schema.owner, owner), (&schema.element, element)] {
            if !self.exists(key, value) {
                return Err(violation(
                    FOREIGN_KEY_VIOLATION,
                    format!(
                        "FOREIGN KEY constraint failed: {}.{} = {} references missing {}",
                        link, key.column, value, key.references
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Fail if any row other than `table[skip]` still references `id`.
    fn check_unreferenced(&self, table: &'static str, id: &Value, skip: usize) -> SqlResult<()> {
        for referencing in self.schema.tables() {
            for key in referencing.foreign_keys.iter().filter(|k| k.references == table) {
                let rows = self
                    .data
                    .tables
                    .get(referencing.name)
                    .map_or(&[][..], |t| t.rows.as_slice());
                let referenced = rows.iter().enumerate().any(|(index, row)| {
                    !(referencing.name == table && index == skip)
                        && row.get(key.column).is_some_and(|v| same_identifier(v, id))
                });
                if referenced {
                    return Err(violation(
                        FOREIGN_KEY_VIOLATION,
                        format!(
                            "FOREIGN KEY constraint failed: {} = {} is referenced by {}.{}",
                            table, id, referencing.name, key.column
                        ),
                    ));
                }
            }
        }
        for link in self.schema.links() {
            let rows = self.data.links.get(link.name).map_or(&[][..], Vec::as_slice);
            let referenced = rows.iter().any(|(owner, element)| {
                (link.owner.references == table && owner == id)
                    || (link.element.references == table && element == id)
            });
            if referenced {
                return Err(violation(
                    FOREIGN_KEY_VIOLATION,
                    format!(
                        "FOREIGN KEY constraint failed: {} = {} is referenced by {}",
                        table, id, link.name
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_write_lock(
        &self,
        connection: ConnectionId,
        table: &'static str,
        id: &Value,
    ) -> SqlResult<()> {
        match self.locks.get(&(table, id.clone().into_identifier())) {
            Some(lock) if !lock.held_only_by(connection) => Err(SqlError::new(
                SqlErrorKind::LockUnavailable,
                format!("row {table} {id} is locked by another connection"),
            )),
            _ => Ok(()),
        }
    }

    // ==================== Statements ====================

    pub fn insert(
        &mut self,
        connection: ConnectionId,
        table: &'static str,
        values: &[(&'static str, Value)],
    ) -> SqlResult<Option<Value>> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let schema = self.table_schema(table)?.clone();
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        self.record(
            connection,
            format!("INSERT INTO {} ({})", table, columns.join(", ")),
        );

        let mut row = Row::from_columns(values.iter().map(|(c, v)| (*c, v.clone())));
        let mut generated = None;
        let assigned = row.get(schema.id_column).filter(|v| !v.is_null()).cloned();
        match assigned {
            Some(id) => {
                if self.position(table, schema.id_column, &id).is_some() {
                    return Err(violation(
                        UNIQUE_VIOLATION,
                        format!("UNIQUE constraint failed: {}.{} = {}", table, schema.id_column, id),
                    ));
                }
            }
            None if schema.generated_id => {
                let entry = self.data.tables.entry(table).or_default();
                entry.sequence += 1;
                let id = Value::BigInt(entry.sequence);
                row.set(schema.id_column, id.clone());
                generated = Some(id);
            }
            None => {}
        }
        if !self.deferred {
            self.check_row(&schema, &row)?;
        }
        self.data.tables.entry(table).or_default().rows.push(row);
        Ok(generated)
    }

    pub fn update(
        &mut self,
        connection: ConnectionId,
        table: &'static str,
        id: &Value,
        changes: &[(&'static str, Value)],
        version: Option<(&'static str, &Value)>,
    ) -> SqlResult<u64> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let schema = self.table_schema(table)?.clone();
        self.check_write_lock(connection, table, id)?;
        let assignments: Vec<String> = changes.iter().map(|(c, _)| format!("{c} = ?")).collect();
        let predicate = match version {
            Some((column, _)) => format!("{} = ? AND {} = ?", schema.id_column, column),
            None => format!("{} = ?", schema.id_column),
        };
        self.record(
            connection,
            format!("UPDATE {} SET {} WHERE {}", table, assignments.join(", "), predicate),
        );

        let Some(index) = self.position(table, schema.id_column, id) else {
            return Ok(0);
        };
        let Some(current) = self.data.tables.get(table).map(|t| t.rows[index].clone()) else {
            return Ok(0);
        };
        if let Some((column, expected)) = version {
            if current.get(column) != Some(expected) {
                return Ok(0);
            }
        }
        let mut row = current;
        for (column, value) in changes {
            row.set(*column, value.clone());
        }
        if !self.deferred {
            self.check_row(&schema, &row)?;
        }
        if let Some(t) = self.data.tables.get_mut(table) {
            t.rows[index] = row;
        }
        Ok(1)
    }

    pub fn delete(
        &mut self,
        connection: ConnectionId,
        table: &'static str,
        id: &Value,
        version: Option<(&'static str, &Value)>,
    ) -> SqlResult<u64> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let id_column = self.table_schema(table)?.id_column;
        self.check_write_lock(connection, table, id)?;
        let predicate = match version {
            Some((column, _)) => format!("{id_column} = ? AND {column} = ?"),
            None => format!("{id_column} = ?"),
        };
        self.record(connection, format!("DELETE FROM {table} WHERE {predicate}"));

        let Some(index) = self.position(table, id_column, id) else {
            return Ok(0);
        };
        if let Some((column, expected)) = version {
            let current = self.data.tables.get(table).and_then(|t| t.rows[index].get(column));
            if current != Some(expected) {
                return Ok(0);
            }
        }
        if !self.deferred {
            self.check_unreferenced(table, id, index)?;
        }
        if let Some(t) = self.data.tables.get_mut(table) {
            t.rows.remove(index);
        }
        Ok(1)
    }

    pub fn select_by_id(
        &mut self,
        connection: ConnectionId,
        table: &'static str,
        id: &Value,
    ) -> SqlResult<Option<Row>> {
        let id_column = self.table_schema(table)?.id_column;
        self.record(connection, format!("SELECT * FROM {table} WHERE {id_column} = ?"));
        Ok(self.find(table, id_column, id))
    }

    fn find(&self, table: &str, id_column: &str, id: &Value) -> Option<Row> {
        let index = self.position(table, id_column, id)?;
        self.data.tables.get(table).map(|t| t.rows[index].clone())
    }

    pub fn select_by_column(
        &mut self,
        connection: ConnectionId,
        table: &'static str,
        column: &str,
        value: &Value,
    ) -> SqlResult<Vec<Row>> {
        self.table_schema(table)?;
        self.record(connection, format!("SELECT * FROM {table} WHERE {column} = ?"));
        Ok(self
            .data
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| row.get(column).is_some_and(|v| same_identifier(v, value)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Try to take a row lock for `connection` without waiting.
    pub fn try_lock_row(
        &mut self,
        connection: ConnectionId,
        table: &'static str,
        id: &Value,
        mode: LockMode,
    ) -> SqlResult<LockAttempt> {
        let id_column = self.table_schema(table)?.id_column;
        let clause = match mode {
            LockMode::PessimisticWrite => " FOR UPDATE",
            LockMode::PessimisticRead => " FOR SHARE",
            _ => "",
        };
        let Some(row) = self.find(table, id_column, id) else {
            self.record(
                connection,
                format!("SELECT * FROM {table} WHERE {id_column} = ?{clause}"),
            );
            return Ok(LockAttempt::Acquired(None));
        };

        let key = (table, id.clone().into_identifier());
        let granted = match (mode, self.locks.get(&key)) {
            (LockMode::PessimisticRead, None) => Some(RowLock::Shared(BTreeSet::from([connection]))),
            (LockMode::PessimisticRead, Some(RowLock::Shared(owners))) => {
                let mut owners = owners.clone();
                owners.insert(connection);
                Some(RowLock::Shared(owners))
            }
            (LockMode::PessimisticWrite, None) => Some(RowLock::Exclusive(connection)),
            (LockMode::PessimisticWrite, Some(lock)) if lock.held_only_by(connection) => {
                Some(RowLock::Exclusive(connection))
            }
            (_, Some(RowLock::Exclusive(owner))) if *owner == connection => None,
            (LockMode::PessimisticRead | LockMode::PessimisticWrite, Some(lock)) => {
                let holder = lock
                    .holders()
                    .into_iter()
                    .find(|c| *c != connection)
                    .unwrap_or_default();
                return Ok(LockAttempt::Blocked(holder));
            }
            _ => None,
        };
        if let Some(lock) = granted {
            self.locks.insert(key, lock);
        }
        self.record(
            connection,
            format!("SELECT * FROM {table} WHERE {id_column} = ?{clause}"),
        );
        Ok(LockAttempt::Acquired(Some(row)))
    }

    pub fn release_locks(&mut self, connection: ConnectionId) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| match lock {
            RowLock::Exclusive(owner) => *owner != connection,
            RowLock::Shared(owners) => {
                owners.remove(&connection);
                !owners.is_empty()
            }
        });
        before - self.locks.len()
    }

    pub fn insert_links(
        &mut self,
        connection: ConnectionId,
        link: &'static str,
        owner: &Value,
        elements: &[Value],
    ) -> SqlResult<u64> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let Some(schema) = self.schema.link(link).copied() else {
            return Err(no_such_table(link));
        };
        for element in elements {
            self.record(
                connection,
                format!(
                    "INSERT INTO {} ({}, {})",
                    link, schema.owner.column, schema.element.column
                ),
            );
            let rows = self.data.links.get(link).map_or(&[][..], Vec::as_slice);
            if rows.iter().any(|(o, e)| o == owner && e == element) {
                return Err(violation(
                    UNIQUE_VIOLATION,
                    format!("UNIQUE constraint failed: {link} ({owner}, {element})"),
                ));
            }
            if !self.deferred {
                self.check_link(link, owner, element)?;
            }
            self.data
                .links
                .entry(link)
                .or_default()
                .push((owner.clone(), element.clone()));
        }
        Ok(elements.len() as u64)
    }

    pub fn delete_links(
        &mut self,
        connection: ConnectionId,
        link: &'static str,
        owner: &Value,
        elements: Option<&[Value]>,
    ) -> SqlResult<u64> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let Some(schema) = self.schema.link(link).copied() else {
            return Err(no_such_table(link));
        };
        let predicate = match elements {
            Some(_) => format!("{} = ? AND {} = ?", schema.owner.column, schema.element.column),
            None => format!("{} = ?", schema.owner.column),
        };
        self.record(connection, format!("DELETE FROM {link} WHERE {predicate}"));

        let rows = self.data.links.entry(link).or_default();
        let before = rows.len();
        rows.retain(|(o, e)| !(o == owner && elements.is_none_or(|list| list.contains(e))));
        Ok((before - rows.len()) as u64)
    }

    pub fn select_links(
        &mut self,
        connection: ConnectionId,
        link: &'static str,
        owner: &Value,
    ) -> SqlResult<Vec<Value>> {
        let Some(schema) = self.schema.link(link).copied() else {
            return Err(no_such_table(link));
        };
        self.record(
            connection,
            format!(
                "SELECT {} FROM {} WHERE {} = ?",
                schema.element.column, link, schema.owner.column
            ),
        );
        Ok(self
            .data
            .links
            .get(link)
            .map(|rows| {
                rows.iter()
                    .filter(|(o, _)| o == owner)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    // ==================== Transactions ====================

    pub fn check_constraints(&self) -> SqlResult<()> {
        for table in self.schema.tables() {
            if let Some(data) = self.data.tables.get(table.name) {
                for row in &data.rows {
                    self.check_row(table, row)?;
                }
            }
        }
        for (link, rows) in &self.data.links {
            for (owner, element) in rows {
                self.check_link(link, owner, element)?;
            }
        }
        Ok(())
    }

    pub fn begin(&mut self, connection: ConnectionId) {
        self.record(connection, "BEGIN".to_string());
        let snapshot = self.data.clone();
        self.transactions.insert(connection, snapshot);
    }

    pub fn in_transaction(&self, connection: ConnectionId) -> bool {
        self.transactions.contains_key(&connection)
    }

    pub fn commit(&mut self, connection: ConnectionId) -> SqlResult<()> {
        if self.deferred {
            if let Err(e) = self.check_constraints() {
                tracing::debug!(connection, error = %e, "Deferred constraint check failed");
                self.rollback(connection);
                return Err(e);
            }
        }
        self.record(connection, "COMMIT".to_string());
        self.transactions.remove(&connection);
        self.release_locks(connection);
        Ok(())
    }

    /// Restore the data seen at `begin` and release the connection's locks.
    pub fn rollback(&mut self, connection: ConnectionId) {
        self.record(connection, "ROLLBACK".to_string());
        if let Some(snapshot) = self.transactions.remove(&connection) {
            self.data = snapshot;
        }
        self.release_locks(connection);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    store: Mutex<Store>,
    pub lock_released: Condvar,
}

impl Shared {
    pub fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to an in-memory database.
///
/// Clones share the same tables. Open connections with
/// [`connect`](Self::connect); inspect and seed data through the handle.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Create an empty database with tables for every registered entity type.
    pub fn new(metadata: &dyn MetadataModel) -> Self {
        let db = Self::default();
        db.shared.store().schema = Schema::from_metadata(metadata);
        db
    }

    /// Check `NOT NULL` and foreign key constraints at commit instead of
    /// per statement.
    #[must_use]
    pub fn with_deferred_constraints(self, deferred: bool) -> Self {
        self.shared.store().deferred = deferred;
        self
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = {
            let mut store = self.shared.store();
            store.next_connection += 1;
            store.next_connection
        };
        tracing::debug!(connection = id, "Connection opened");
        MemoryConnection::new(self.clone(), id)
    }

    pub fn schema(&self) -> Schema {
        self.shared.store().schema.clone()
    }

    /// Validate every row against the schema constraints.
    pub fn check_constraints(&self) -> SqlResult<()> {
        self.shared.store().check_constraints()
    }

    // ========================================================================
    // Seeding and Inspection
    // ========================================================================

    /// Store a row directly, bypassing constraints and the statement log.
    pub fn insert_row(&self, table: &'static str, row: Row) {
        let mut store = self.shared.store();
        let id_column = store.schema.table(table).map_or("id", |t| t.id_column);
        let entry = store.data.tables.entry(table).or_default();
        if let Some(id) = row.get(id_column).and_then(Value::as_i64) {
            entry.sequence = entry.sequence.max(id);
        }
        entry.rows.push(row);
    }

    /// Store a link row directly.
    pub fn insert_link(&self, link: &'static str, owner: impl Into<Value>, element: impl Into<Value>) {
        self.shared
            .store()
            .data
            .links
            .entry(link)
            .or_default()
            .push((owner.into(), element.into()));
    }

    pub fn row(&self, table: &str, id: impl Into<Value>) -> Option<Row> {
        let store = self.shared.store();
        let id_column = store.schema.table(table)?.id_column;
        store.find(table, id_column, &id.into())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.shared
            .store()
            .data
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .store()
            .data
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// (owner, element) pairs of a link table in insertion order.
    pub fn links(&self, link: &str) -> Vec<(Value, Value)> {
        self.shared
            .store()
            .data
            .links
            .get(link)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrite one column, as a concurrent writer would.
    pub fn set_column(&self, table: &str, id: impl Into<Value>, column: &str, value: impl Into<Value>) -> bool {
        let mut store = self.shared.store();
        let Some(id_column) = store.schema.table(table).map(|t| t.id_column) else {
            return false;
        };
        let Some(index) = store.position(table, id_column, &id.into()) else {
            return false;
        };
        match store.data.tables.get_mut(table) {
            Some(t) => {
                t.rows[index].set(column, value.into());
                true
            }
            None => false,
        }
    }

    /// Delete a row directly, as a concurrent writer would.
    pub fn delete_row(&self, table: &str, id: impl Into<Value>) -> bool {
        let mut store = self.shared.store();
        let Some(id_column) = store.schema.table(table).map(|t| t.id_column) else {
            return false;
        };
        let Some(index) = store.position(table, id_column, &id.into()) else {
            return false;
        };
        store
            .data
            .tables
            .get_mut(table)
            .map(|t| t.rows.remove(index))
            .is_some()
    }

    /// Every statement executed so far, rendered as SQL.
    pub fn statements(&self) -> Vec<String> {
        self.shared.store().log.clone()
    }

    /// Executed statements other than `SELECT` and transaction control.
    pub fn writes(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| {
                s.starts_with("INSERT") || s.starts_with("UPDATE") || s.starts_with("DELETE")
            })
            .collect()
    }

    pub fn clear_statements(&self) {
        self.shared.store().log.clear();
    }

    /// Fail the next write statement with `error`.
    pub fn fail_next(&self, error: SqlError) {
        self.fail_after(0, error);
    }

    /// Let `skip` write statements succeed, then fail the next one.
    pub fn fail_after(&self, skip: usize, error: SqlError) {
        self.shared.store().failure = Some(Failure { skip, error });
    }

    /// Number of rows currently locked by any connection.
    pub fn locked_rows(&self) -> usize {
        self.shared.store().locks.len()
    }
}
