//! Connection implementing the SQL-execution facade.

use std::time::{Duration, Instant};

use unitwork_core::{
    EntityType, GeneratedValues, LinkTable, LockMode, Row, SqlError, SqlErrorKind, SqlExecutor,
    SqlResult, Value,
};

use crate::database::{ConnectionId, LockAttempt, MemoryDatabase};

/// One connection to a [`MemoryDatabase`].
///
/// Row locks taken through [`SqlExecutor::select_for_lock`] belong to the
/// connection until [`commit`](Self::commit), [`rollback`](Self::rollback),
/// [`release_locks`](Self::release_locks) or drop.
#[derive(Debug)]
pub struct MemoryConnection {
    database: MemoryDatabase,
    id: ConnectionId,
}

impl MemoryConnection {
    pub(crate) fn new(database: MemoryDatabase, id: ConnectionId) -> Self {
        Self { database, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    /// Start a transaction. Rolling back restores the data as of this call.
    pub fn begin(&self) {
        self.database.shared().store().begin(self.id);
    }

    pub fn in_transaction(&self) -> bool {
        self.database.shared().store().in_transaction(self.id)
    }

    /// Check deferred constraints, end the transaction and release locks.
    ///
    /// A failed deferred check rolls the transaction back.
    pub fn commit(&self) -> SqlResult<()> {
        let result = self.database.shared().store().commit(self.id);
        self.database.shared().lock_released.notify_all();
        result
    }

    pub fn rollback(&self) {
        self.database.shared().store().rollback(self.id);
        self.database.shared().lock_released.notify_all();
    }

    /// Release every row lock held by this connection.
    pub fn release_locks(&self) -> usize {
        let released = self.database.shared().store().release_locks(self.id);
        if released > 0 {
            tracing::debug!(connection = self.id, released, "Row locks released");
            self.database.shared().lock_released.notify_all();
        }
        released
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.in_transaction() {
            self.rollback();
        } else {
            self.release_locks();
        }
    }
}

fn version_predicate<'a>(
    entity_type: &EntityType,
    expected: Option<&'a Value>,
) -> Option<(&'static str, &'a Value)> {
    entity_type.version_column.zip(expected)
}

impl SqlExecutor for MemoryConnection {
    fn insert(
        &self,
        entity_type: &EntityType,
        values: &[(&'static str, Value)],
    ) -> SqlResult<GeneratedValues> {
        let id = self
            .database
            .shared()
            .store()
            .insert(self.id, entity_type.table, values)?;
        Ok(GeneratedValues { id, version: None })
    }

    fn update(
        &self,
        entity_type: &EntityType,
        id: &Value,
        changes: &[(&'static str, Value)],
        expected_version: Option<&Value>,
    ) -> SqlResult<u64> {
        self.database.shared().store().update(
            self.id,
            entity_type.table,
            id,
            changes,
            version_predicate(entity_type, expected_version),
        )
    }

    fn delete(
        &self,
        entity_type: &EntityType,
        id: &Value,
        expected_version: Option<&Value>,
    ) -> SqlResult<u64> {
        self.database.shared().store().delete(
            self.id,
            entity_type.table,
            id,
            version_predicate(entity_type, expected_version),
        )
    }

    fn select_by_id(&self, entity_type: &EntityType, id: &Value) -> SqlResult<Option<Row>> {
        self.database
            .shared()
            .store()
            .select_by_id(self.id, entity_type.table, id)
    }

    /// Locking read. Without a timeout a conflicting lock fails at once
    /// (NOWAIT); with one the call waits for the holder to release.
    fn select_for_lock(
        &self,
        entity_type: &EntityType,
        id: &Value,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> SqlResult<Option<Row>> {
        let shared = self.database.shared();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut store = shared.store();
        loop {
            let holder = match store.try_lock_row(self.id, entity_type.table, id, mode)? {
                LockAttempt::Acquired(row) => return Ok(row),
                LockAttempt::Blocked(holder) => holder,
            };
            let Some(deadline) = deadline else {
                tracing::debug!(connection = self.id, holder, table = entity_type.table, "Row lock unavailable");
                return Err(SqlError::new(
                    SqlErrorKind::LockUnavailable,
                    format!(
                        "could not obtain {:?} lock on {} {}: held by connection {}",
                        mode, entity_type.table, id, holder
                    ),
                ));
            };
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(connection = self.id, holder, table = entity_type.table, "Row lock wait timed out");
                return Err(SqlError::new(
                    SqlErrorKind::LockTimeout,
                    format!(
                        "lock wait timeout for {:?} lock on {} {}",
                        mode, entity_type.table, id
                    ),
                ));
            }
            store = shared
                .lock_released
                .wait_timeout(store, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn select_by_column(
        &self,
        entity_type: &EntityType,
        column: &str,
        value: &Value,
    ) -> SqlResult<Vec<Row>> {
        self.database
            .shared()
            .store()
            .select_by_column(self.id, entity_type.table, column, value)
    }

    fn insert_links(&self, link: &LinkTable, owner: &Value, elements: &[Value]) -> SqlResult<u64> {
        self.database
            .shared()
            .store()
            .insert_links(self.id, link.table, owner, elements)
    }

    fn delete_links(
        &self,
        link: &LinkTable,
        owner: &Value,
        elements: Option<&[Value]>,
    ) -> SqlResult<u64> {
        self.database
            .shared()
            .store()
            .delete_links(self.id, link.table, owner, elements)
    }

    fn select_links(&self, link: &LinkTable, owner: &Value) -> SqlResult<Vec<Value>> {
        self.database
            .shared()
            .store()
            .select_links(self.id, link.table, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use unitwork_core::{MetadataModel, MetadataRegistry, PropertyInfo};

    fn setup() -> (MemoryDatabase, Arc<EntityType>) {
        let mut registry = MetadataRegistry::new();
        registry
            .register(
                EntityType::new("Account", "account")
                    .versioned("version")
                    .property(PropertyInfo::basic("balance")),
            )
            .unwrap();
        let metadata = registry.build().unwrap();
        let db = MemoryDatabase::new(metadata.as_ref());
        db.insert_row(
            "account",
            Row::from_columns([
                ("id", Value::BigInt(1)),
                ("version", Value::BigInt(0)),
                ("balance", Value::BigInt(100)),
            ]),
        );
        (db, metadata.require("Account").unwrap())
    }

    #[test]
    fn test_insert_returns_generated_id() {
        let (db, account) = setup();
        let conn = db.connect();
        let generated = conn
            .insert(&account, &[("version", Value::BigInt(0)), ("balance", Value::BigInt(5))])
            .unwrap();
        assert_eq!(generated.id, Some(Value::BigInt(2)));
        assert_eq!(db.row_count("account"), 2);
        assert_eq!(db.writes(), vec!["INSERT INTO account (version, balance)"]);
    }

    #[test]
    fn test_update_uses_version_predicate() {
        let (db, account) = setup();
        let conn = db.connect();
        let changes = [("balance", Value::BigInt(90)), ("version", Value::BigInt(1))];
        assert_eq!(
            conn.update(&account, &Value::BigInt(1), &changes, Some(&Value::BigInt(0)))
                .unwrap(),
            1
        );
        assert_eq!(
            conn.update(&account, &Value::BigInt(1), &changes, Some(&Value::BigInt(0)))
                .unwrap(),
            0
        );
        let row = db.row("account", 1i64).unwrap();
        assert_eq!(row.get("balance"), Some(&Value::BigInt(90)));
    }

    #[test]
    fn test_nowait_lock_conflict() {
        let (db, account) = setup();
        let first = db.connect();
        let second = db.connect();
        let id = Value::BigInt(1);

        assert!(first
            .select_for_lock(&account, &id, LockMode::PessimisticWrite, None)
            .unwrap()
            .is_some());
        let err = second
            .select_for_lock(&account, &id, LockMode::PessimisticRead, None)
            .unwrap_err();
        assert_eq!(err.kind, SqlErrorKind::LockUnavailable);
        let err = second
            .delete(&account, &id, Some(&Value::BigInt(0)))
            .unwrap_err();
        assert_eq!(err.kind, SqlErrorKind::LockUnavailable);

        assert_eq!(first.release_locks(), 1);
        assert!(second
            .select_for_lock(&account, &id, LockMode::PessimisticRead, None)
            .is_ok());
        assert!(db
            .statements()
            .iter()
            .any(|s| s == "SELECT * FROM account WHERE id = ? FOR SHARE"));
    }

    #[test]
    fn test_lock_wait_times_out() {
        let (db, account) = setup();
        let first = db.connect();
        let second = db.connect();
        let id = Value::BigInt(1);
        first
            .select_for_lock(&account, &id, LockMode::PessimisticWrite, None)
            .unwrap();

        let started = Instant::now();
        let err = second
            .select_for_lock(
                &account,
                &id,
                LockMode::PessimisticWrite,
                Some(Duration::from_millis(20)),
            )
            .unwrap_err();
        assert_eq!(err.kind, SqlErrorKind::LockTimeout);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_lock_wait_succeeds_after_release() {
        let (db, account) = setup();
        let first = db.connect();
        let id = Value::BigInt(1);
        first
            .select_for_lock(&account, &id, LockMode::PessimisticWrite, None)
            .unwrap();

        let waiter = {
            let db = db.clone();
            let account = Arc::clone(&account);
            thread::spawn(move || {
                let second = db.connect();
                second
                    .select_for_lock(
                        &account,
                        &Value::BigInt(1),
                        LockMode::PessimisticWrite,
                        Some(Duration::from_secs(5)),
                    )
                    .map(|row| row.is_some())
            })
        };
        thread::sleep(Duration::from_millis(20));
        first.commit().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(true));
        // The waiter's connection was dropped, releasing its lock.
        assert_eq!(db.locked_rows(), 0);
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let (db, account) = setup();
        {
            let conn = db.connect();
            conn.begin();
            conn.delete(&account, &Value::BigInt(1), None).unwrap();
            assert_eq!(db.row_count("account"), 0);
        }
        assert_eq!(db.row_count("account"), 1);
    }

    #[test]
    fn test_links_through_connection() {
        let mut registry = MetadataRegistry::new();
        registry
            .register(EntityType::new("Tag", "tag").property(PropertyInfo::many_to_many(
                "related",
                "Tag",
                LinkTable::new("tag_related", "tag_id", "related_id"),
            )))
            .unwrap();
        let db = MemoryDatabase::new(registry.build().unwrap().as_ref());
        db.insert_row("tag", Row::from_columns([("id", Value::BigInt(1))]));
        db.insert_row("tag", Row::from_columns([("id", Value::BigInt(2))]));
        let conn = db.connect();
        let link = LinkTable::new("tag_related", "tag_id", "related_id");

        conn.insert_links(&link, &Value::BigInt(1), &[Value::BigInt(2), Value::BigInt(1)])
            .unwrap();
        assert_eq!(
            conn.select_links(&link, &Value::BigInt(1)).unwrap(),
            vec![Value::BigInt(2), Value::BigInt(1)]
        );
        assert_eq!(
            conn.delete_links(&link, &Value::BigInt(1), Some(&[Value::BigInt(1)]))
                .unwrap(),
            1
        );
        assert_eq!(db.links("tag_related"), vec![(Value::BigInt(1), Value::BigInt(2))]);
        assert_eq!(
            db.writes().last().map(String::as_str),
            Some("DELETE FROM tag_related WHERE tag_id = ? AND related_id = ?")
        );
    }
}
