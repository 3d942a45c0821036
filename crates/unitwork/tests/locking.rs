//! Lock modes across two connections to the same in-memory database.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{context, named_row, person_row, setup};
use unitwork::prelude::*;
use unitwork::{ActionKind, SqlErrorKind};

#[test]
fn pessimistic_write_lock_conflict_fails_without_timeout() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut holder = context(&metadata, &db);
    let mut other = context(&metadata, &db);

    let mine = holder.find("Person", 1i64).unwrap().unwrap();
    holder.lock(&mine, LockMode::PessimisticWrite).unwrap();
    assert_eq!(db.locked_rows(), 1);
    assert!(db
        .statements()
        .contains(&"SELECT * FROM person WHERE id = ? FOR UPDATE".to_string()));

    let theirs = other.find("Person", 1i64).unwrap().unwrap();
    let err = other.lock(&theirs, LockMode::PessimisticWrite).unwrap_err();
    assert!(matches!(
        err,
        Error::LockAcquisition {
            entity_type: "Person",
            mode: LockMode::PessimisticWrite,
            ..
        }
    ));
    assert!(err.is_retryable());

    holder.executor().commit().unwrap();
    assert_eq!(db.locked_rows(), 0);
    other.lock(&theirs, LockMode::PessimisticWrite).unwrap();
    assert_eq!(
        other.entry(&theirs).unwrap().lock_mode(),
        LockMode::PessimisticWrite
    );
}

#[test]
fn shared_locks_coexist() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut first = context(&metadata, &db);
    let mut second = context(&metadata, &db);

    let a = first.find("Person", 1i64).unwrap().unwrap();
    let b = second.find("Person", 1i64).unwrap().unwrap();
    first.lock(&a, LockMode::PessimisticRead).unwrap();
    second.lock(&b, LockMode::PessimisticRead).unwrap();
    assert_eq!(db.locked_rows(), 1);

    assert!(matches!(
        first.lock(&a, LockMode::PessimisticWrite),
        Err(Error::LockAcquisition { .. })
    ));
}

#[test]
fn lock_wait_times_out() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut holder = context(&metadata, &db);
    let config = SessionConfig::new().lock_timeout_ms(Some(20));
    let mut waiter = PersistenceContext::with_config(Arc::clone(&metadata), db.connect(), config);

    let mine = holder.find("Person", 1i64).unwrap().unwrap();
    holder.lock(&mine, LockMode::PessimisticWrite).unwrap();

    let theirs = waiter.find("Person", 1i64).unwrap().unwrap();
    let err = waiter.lock(&theirs, LockMode::PessimisticRead).unwrap_err();
    assert!(matches!(
        err,
        Error::LockTimeout {
            entity_type: "Person",
            mode: LockMode::PessimisticRead,
            ..
        }
    ));
    assert_eq!(waiter.entry(&theirs).unwrap().lock_mode(), LockMode::Read);
}

#[test]
fn lock_wait_succeeds_once_holder_commits() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut holder = context(&metadata, &db);
    let mine = holder.find("Person", 1i64).unwrap().unwrap();
    holder.lock(&mine, LockMode::PessimisticWrite).unwrap();

    let waiter = {
        let metadata = Arc::clone(&metadata);
        let db = db.clone();
        thread::spawn(move || {
            let config = SessionConfig::new().lock_timeout_ms(Some(5_000));
            let mut ctx = PersistenceContext::with_config(metadata, db.connect(), config);
            let theirs = ctx.find("Person", 1i64).unwrap().expect("seeded row");
            ctx.lock(&theirs, LockMode::PessimisticWrite).unwrap();
            ctx.entry(&theirs).map(|entry| entry.lock_mode())
        })
    };

    thread::sleep(Duration::from_millis(50));
    holder.executor().commit().unwrap();

    let mode = waiter.join().expect("waiter panicked");
    assert_eq!(mode, Some(LockMode::PessimisticWrite));
}

#[test]
fn write_to_row_locked_elsewhere_fails() {
    let (metadata, db) = setup();
    db.insert_row("member", named_row(1, "Ada"));
    let mut holder = context(&metadata, &db);
    let mut writer = context(&metadata, &db);

    let mine = holder.find("Member", 1i64).unwrap().unwrap();
    holder.lock(&mine, LockMode::PessimisticWrite).unwrap();

    let theirs = writer.find("Member", 1i64).unwrap().unwrap();
    theirs.write().set("name", "Grace").unwrap();
    match writer.flush().unwrap_err() {
        Error::SqlExecution {
            action, source, ..
        } => {
            assert_eq!(action, ActionKind::EntityUpdate);
            assert_eq!(source.kind, SqlErrorKind::LockUnavailable);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        db.row("member", 1i64).unwrap().get("name"),
        Some(&Value::from("Ada"))
    );
}

#[test]
fn optimistic_lock_detects_concurrent_commit() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut reader = context(&metadata, &db);
    let mut writer = context(&metadata, &db);

    let seen = reader.find("Person", 1i64).unwrap().unwrap();
    reader.lock(&seen, LockMode::Optimistic).unwrap();

    let changed = writer.find("Person", 1i64).unwrap().unwrap();
    changed.write().set("name", "Grace").unwrap();
    writer.flush().unwrap();

    assert!(matches!(
        reader.flush(),
        Err(Error::StaleState {
            entity_type: "Person",
            action: ActionKind::Lock,
            ..
        })
    ));
}

#[test]
fn optimistic_lock_passes_when_row_unchanged() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut ctx = context(&metadata, &db);
    let ada = ctx.find("Person", 1i64).unwrap().unwrap();
    ctx.lock(&ada, LockMode::Optimistic).unwrap();

    assert!(ctx.flush().unwrap().is_empty());
    assert!(db.writes().is_empty());
}

#[test]
fn force_increment_bumps_version_for_readers() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut ctx = context(&metadata, &db);
    let ada = ctx.find("Person", 1i64).unwrap().unwrap();

    ctx.lock(&ada, LockMode::OptimisticForceIncrement).unwrap();
    let result = ctx.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(
        db.writes(),
        vec!["UPDATE person SET version = ? WHERE id = ? AND version = ?"]
    );
    assert_eq!(db.row("person", 1i64).unwrap().get("version"), Some(&Value::BigInt(1)));
    assert_eq!(ctx.entry(&ada).unwrap().lock_mode(), LockMode::Write);
}

#[test]
fn optimistic_modes_require_a_version_column() {
    let (metadata, db) = setup();
    db.insert_row("member", named_row(1, "Ada"));
    let mut ctx = context(&metadata, &db);
    let ada = ctx.find("Member", 1i64).unwrap().unwrap();

    for mode in [LockMode::Optimistic, LockMode::OptimisticForceIncrement] {
        assert!(matches!(ctx.lock(&ada, mode), Err(Error::InvalidMetadata(_))));
    }
    ctx.lock(&ada, LockMode::PessimisticWrite).unwrap();
}
