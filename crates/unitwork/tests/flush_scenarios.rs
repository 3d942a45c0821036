//! End-to-end flush behavior against the in-memory database.
//!
//! Constraints are checked per statement unless a test opts into deferred
//! checking, so a mis-ordered flush fails here the way it would on a real
//! server.

mod common;

use std::sync::Arc;

use common::{
    context, link_chain, named_row, new_named, person_row, seed_department, setup,
    write_summary,
};
use unitwork::prelude::*;
use unitwork::{ActionKind, MapCacheRegion, SqlError, SqlErrorKind};

#[test]
fn simple_insert_populates_generated_id() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);

    let ada = new_named(&ctx, "Person", "Ada");
    assert!(ada.id().is_null());
    ctx.persist(&ada).unwrap();
    let result = ctx.flush().unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(result.total(), 1);
    assert_eq!(write_summary(&db), vec!["insert person"]);
    assert_eq!(ada.id(), Value::BigInt(1));
    assert!(ctx.entry(&ada).unwrap().exists_in_database());
    assert_eq!(ctx.status(&ada), Some(EntityStatus::Managed));

    let row = db.row("person", 1i64).unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("Ada")));
    assert_eq!(row.get("version"), Some(&Value::BigInt(0)));
}

#[test]
fn update_elision_then_single_column_update() {
    let (metadata, db) = setup();
    db.insert_row("member", named_row(1, "Ada"));
    let mut ctx = context(&metadata, &db);

    let ada = ctx.find("Member", 1i64).unwrap().unwrap();
    assert!(ctx.flush().unwrap().is_empty());
    assert!(db.writes().is_empty());

    ada.write().set("name", "Ada L.").unwrap();
    let result = ctx.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(db.writes(), vec!["UPDATE member SET name = ? WHERE id = ?"]);
    assert_eq!(
        db.row("member", 1i64).unwrap().get("name"),
        Some(&Value::from("Ada L."))
    );
}

#[test]
fn versioned_update_carries_version_predicate() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut ctx = context(&metadata, &db);

    let ada = ctx.find("Person", 1i64).unwrap().unwrap();
    ada.write().set("name", "Ada L.").unwrap();
    ctx.flush().unwrap();

    assert_eq!(
        db.writes(),
        vec!["UPDATE person SET name = ?, version = ? WHERE id = ? AND version = ?"]
    );
    assert_eq!(db.row("person", 1i64).unwrap().get("version"), Some(&Value::BigInt(1)));
    assert_eq!(ada.read().version(), &Value::BigInt(1));
}

#[test]
fn concurrent_update_is_stale_and_not_applied() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let mut first = context(&metadata, &db);
    let mut second = context(&metadata, &db);

    let mine = first.find("Person", 1i64).unwrap().unwrap();
    let theirs = second.find("Person", 1i64).unwrap().unwrap();
    assert!(!mine.ptr_eq(&theirs));

    theirs.write().set("name", "Grace").unwrap();
    second.flush().unwrap();

    mine.write().set("name", "Ada L.").unwrap();
    let err = first.flush().unwrap_err();
    assert!(matches!(
        err,
        Error::StaleState {
            entity_type: "Person",
            action: ActionKind::EntityUpdate,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(first.flush_state(), unitwork::FlushState::Failed);
    assert_eq!(
        db.row("person", 1i64).unwrap().get("name"),
        Some(&Value::from("Grace"))
    );
}

#[test]
fn parent_insert_precedes_child_in_either_call_order() {
    for child_first in [true, false] {
        let (metadata, db) = setup();
        let mut ctx = context(&metadata, &db);
        let department = new_named(&ctx, "Department", "Research");
        let employee = new_named(&ctx, "Employee", "Ivo");
        employee
            .write()
            .set_reference("department", Some(&department))
            .unwrap();

        if child_first {
            ctx.persist(&employee).unwrap();
            ctx.persist(&department).unwrap();
        } else {
            ctx.persist(&department).unwrap();
            ctx.persist(&employee).unwrap();
        }
        ctx.flush().unwrap();

        assert_eq!(write_summary(&db), vec!["insert department", "insert employee"]);
        let row = db.row("employee", employee.id()).unwrap();
        assert_eq!(row.get("department_id"), Some(&department.id()));
    }
}

#[test]
fn cascade_delete_removes_children_first() {
    let (metadata, db) = setup();
    seed_department(&db);
    let mut ctx = context(&metadata, &db);

    let department = ctx.find("Department", 1i64).unwrap().unwrap();
    ctx.remove(&department).unwrap();
    let result = ctx.flush().unwrap();

    assert_eq!(result.deleted, 3);
    assert_eq!(
        write_summary(&db),
        vec!["delete employee", "delete employee", "delete department"]
    );
    assert_eq!(db.row_count("employee"), 0);
    assert_eq!(db.row_count("department"), 0);
    assert_eq!(ctx.tracked_count(), 0);
}

#[test]
fn mutual_not_null_references_flush_with_deferred_key() {
    let (metadata, _) = setup();
    let db = MemoryDatabase::new(metadata.as_ref()).with_deferred_constraints(true);
    let mut ctx = context(&metadata, &db);
    ctx.executor().begin();

    let husband = new_named(&ctx, "Husband", "Pierre");
    let wife = new_named(&ctx, "Wife", "Marie");
    husband.write().set_reference("wife", Some(&wife)).unwrap();
    wife.write().set_reference("husband", Some(&husband)).unwrap();
    ctx.persist(&husband).unwrap();
    let result = ctx.flush().unwrap();

    assert_eq!(result.inserted, 2);
    assert_eq!(result.post_insert_updates, 1);
    assert_eq!(
        db.writes(),
        vec![
            "INSERT INTO husband (name, wife_id)",
            "INSERT INTO wife (name, husband_id)",
            "UPDATE husband SET wife_id = ? WHERE id = ?",
        ]
    );
    ctx.executor().commit().unwrap();

    let row = db.row("husband", husband.id()).unwrap();
    assert_eq!(row.get("wife_id"), Some(&wife.id()));
    assert!(ctx.flush().unwrap().is_empty());
}

#[test]
fn mutual_not_null_references_need_deferred_constraints() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let husband = new_named(&ctx, "Husband", "Pierre");
    let wife = new_named(&ctx, "Wife", "Marie");
    husband.write().set_reference("wife", Some(&wife)).unwrap();
    wife.write().set_reference("husband", Some(&husband)).unwrap();
    ctx.persist(&wife).unwrap();

    let err = ctx.flush().unwrap_err();
    match err {
        Error::SqlExecution {
            action,
            entity_type,
            source,
            ..
        } => {
            assert_eq!(action, ActionKind::EntityInsert);
            assert_eq!(entity_type, "Wife");
            assert_eq!(source.kind, SqlErrorKind::ConstraintViolation);
            assert_eq!(source.sqlstate.as_deref(), Some("23502"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn self_reference_is_set_by_post_insert_update() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let root = new_named(&ctx, "Category", "Root");
    root.write().set_reference("parent", Some(&root)).unwrap();
    ctx.persist(&root).unwrap();

    let result = ctx.flush().unwrap();
    assert_eq!(result.post_insert_updates, 1);
    assert_eq!(write_summary(&db), vec!["insert category", "update category"]);
    assert_eq!(
        db.row("category", root.id()).unwrap().get("parent_id"),
        Some(&root.id())
    );
}

#[test]
fn link_table_rows_follow_collection_changes() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let student = new_named(&ctx, "Student", "Lin");
    let algebra = ctx.instantiate("Course").unwrap();
    let biology = ctx.instantiate("Course").unwrap();
    {
        let mut guard = student.write();
        let courses = guard.collection_mut("courses").unwrap();
        courses.push(&algebra);
        courses.push(&biology);
    }
    ctx.persist(&student).unwrap();
    let result = ctx.flush().unwrap();
    assert_eq!(result.inserted, 3);
    assert_eq!(result.collections_recreated, 1);
    assert_eq!(db.links("enrollment").len(), 2);

    db.clear_statements();
    student
        .write()
        .collection_mut("courses")
        .unwrap()
        .remove(&algebra);
    let result = ctx.flush().unwrap();
    assert_eq!(result.collections_updated, 1);
    assert_eq!(
        db.writes(),
        vec![
            "UPDATE student SET version = ? WHERE id = ? AND version = ?",
            "DELETE FROM enrollment WHERE student_id = ? AND course_id = ?",
        ]
    );
    assert_eq!(db.links("enrollment"), vec![(student.id(), biology.id())]);

    db.clear_statements();
    ctx.remove(&student).unwrap();
    let result = ctx.flush().unwrap();
    assert_eq!(result.collections_removed, 1);
    assert_eq!(write_summary(&db), vec!["delete enrollment", "delete student"]);
    assert_eq!(db.row_count("course"), 2);
}

#[test]
fn orphan_removed_from_collection_is_deleted() {
    let (metadata, db) = setup();
    seed_department(&db);
    let mut ctx = context(&metadata, &db);

    let department = ctx.find("Department", 1i64).unwrap().unwrap();
    let employees = ctx.initialize_collection(&department, "employees").unwrap();
    assert_eq!(employees.len(), 2);
    department
        .write()
        .collection_mut("employees")
        .unwrap()
        .remove(&employees[0]);
    ctx.flush().unwrap();

    assert_eq!(db.writes(), vec!["DELETE FROM employee WHERE id = ?"]);
    assert_eq!(db.row_count("employee"), 1);
    assert!(!ctx.contains(&employees[0]));
}

#[test]
fn transient_reference_fails_before_any_write() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let department = new_named(&ctx, "Department", "Unsaved");
    let employee = new_named(&ctx, "Employee", "Ivo");
    employee
        .write()
        .set_reference("department", Some(&department))
        .unwrap();
    ctx.persist(&employee).unwrap();

    assert!(matches!(
        ctx.flush(),
        Err(Error::TransientPropertyViolation {
            entity_type: "Employee",
            property: "department",
            target_type: "Department",
        })
    ));
    assert!(db.statements().is_empty());
}

#[test]
fn failed_flush_rolls_back_with_transaction() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    ctx.executor().begin();
    for name in ["Ada", "Grace", "Lin"] {
        let member = new_named(&ctx, "Member", name);
        ctx.persist(&member).unwrap();
    }
    db.fail_after(1, SqlError::new(SqlErrorKind::Connection, "connection reset"));

    let err = ctx.flush().unwrap_err();
    assert!(matches!(
        err,
        Error::SqlExecution {
            action: ActionKind::EntityInsert,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(db.row_count("member"), 1);

    ctx.executor().rollback();
    assert_eq!(db.row_count("member"), 0);

    let mut retry = context(&metadata, &db);
    let member = new_named(&retry, "Member", "Ada");
    retry.persist(&member).unwrap();
    assert_eq!(retry.flush().unwrap().inserted, 1);
}

#[test]
fn auto_flush_only_when_query_touches_pending_types() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let member = new_named(&ctx, "Member", "Ada");
    ctx.persist(&member).unwrap();

    assert_eq!(ctx.auto_flush_if_needed(&["Person"]).unwrap(), None);
    assert!(db.writes().is_empty());
    let result = ctx.auto_flush_if_needed(&["Member", "Person"]).unwrap().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(db.row_count("member"), 1);
}

#[test]
fn second_level_cache_is_shared_by_factory_contexts() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));
    let cache = Arc::new(MapCacheRegion::new());
    let factory = SessionFactory::builder()
        .metadata(Arc::clone(&metadata))
        .cache(cache.clone())
        .build()
        .unwrap();

    let mut first = factory.open(db.connect());
    first.find("Person", 1i64).unwrap().unwrap();
    assert_eq!(db.statements().len(), 1);

    let mut second = factory.open(db.connect());
    let copy = second.find("Person", 1i64).unwrap().unwrap();
    assert_eq!(db.statements().len(), 1);
    assert_eq!(copy.read().scalar("name"), Some(&Value::from("Ada")));
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn merge_applies_detached_changes_in_new_context() {
    let (metadata, db) = setup();
    db.insert_row("person", person_row(1, "Ada", 0));

    let mut first = context(&metadata, &db);
    let detached = first.find("Person", 1i64).unwrap().unwrap();
    first.close();
    detached.write().set("name", "Ada L.").unwrap();

    let mut second = context(&metadata, &db);
    let managed = second.merge(&detached).unwrap();
    assert!(!managed.ptr_eq(&detached));
    assert_eq!(managed.read().scalar("name"), Some(&Value::from("Ada L.")));
    second.flush().unwrap();
    assert_eq!(
        db.row("person", 1i64).unwrap().get("name"),
        Some(&Value::from("Ada L."))
    );
}

#[test]
fn lazy_reference_resolves_to_managed_instance() {
    let (metadata, db) = setup();
    seed_department(&db);
    let mut ctx = context(&metadata, &db);

    let employee = ctx.find("Employee", 10i64).unwrap().unwrap();
    assert!(matches!(
        employee.read().reference("department"),
        Some(Reference::Unloaded(key)) if *key == EntityKey::new("Department", 1i64)
    ));
    let department = ctx.load_reference(&employee, "department").unwrap().unwrap();
    assert_eq!(department.read().scalar("name"), Some(&Value::from("Research")));

    let again = ctx.find("Employee", 11i64).unwrap().unwrap();
    assert!(matches!(
        again.read().reference("department"),
        Some(Reference::Loaded(d)) if d.ptr_eq(&department)
    ));
    assert!(ctx.flush().unwrap().is_empty());
}

#[test]
fn find_accepts_unsuffixed_integer_ids() {
    let (metadata, db) = setup();
    let mut first = context(&metadata, &db);
    let ada = new_named(&first, "Member", "Ada");
    first.persist(&ada).unwrap();
    first.flush().unwrap();
    assert_eq!(ada.id(), Value::BigInt(1));
    assert!(first.find("Member", 1).unwrap().unwrap().ptr_eq(&ada));

    let mut second = context(&metadata, &db);
    let found = second.find("Member", 1).unwrap().expect("stored row");
    assert_eq!(found.read().scalar("name"), Some(&Value::from("Ada")));
    assert!(second.find("Member", 1i64).unwrap().unwrap().ptr_eq(&found));
}

const CHAIN: usize = 10_000;

#[test]
fn long_chain_survives_persist_merge_remove_and_drop() {
    let (metadata, db) = setup();

    let mut first = context(&metadata, &db);
    let head = link_chain(&first, CHAIN);
    first.persist(&head).unwrap();
    assert_eq!(first.tracked_count(), CHAIN);
    let result = first.flush().unwrap();
    assert_eq!(result.inserted, CHAIN);
    assert_eq!(db.row_count("link"), CHAIN);
    first.close();
    drop(first);

    head.write().set("label", "renamed head").unwrap();
    let mut second = context(&metadata, &db);
    let managed = second.merge(&head).unwrap();
    assert!(!managed.ptr_eq(&head));
    assert_eq!(second.tracked_count(), CHAIN);
    // The detached graph is now owned by `head` alone.
    drop(head);

    let result = second.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(
        db.row("link", managed.id()).unwrap().get("label"),
        Some(&Value::from("renamed head"))
    );

    second.remove(&managed).unwrap();
    let result = second.flush().unwrap();
    assert_eq!(result.deleted, CHAIN);
    assert_eq!(db.row_count("link"), 0);
    assert_eq!(second.tracked_count(), 0);
    drop(second);
    drop(managed);
}

#[test]
fn long_transient_chain_merges_as_inserts() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let head = link_chain(&ctx, CHAIN);

    let managed = ctx.merge(&head).unwrap();
    assert!(!managed.ptr_eq(&head));
    assert!(!ctx.contains(&head));
    assert_eq!(ctx.tracked_count(), CHAIN);
    drop(head);

    let result = ctx.flush().unwrap();
    assert_eq!(result.inserted, CHAIN);
    assert_eq!(result.post_insert_updates, 0);
    assert_eq!(db.row_count("link"), CHAIN);
}

#[test]
fn dropping_a_flushed_chain_after_clear_releases_it() {
    let (metadata, db) = setup();
    let mut ctx = context(&metadata, &db);
    let head = link_chain(&ctx, CHAIN);
    ctx.persist(&head).unwrap();
    ctx.flush().unwrap();

    assert!(matches!(
        head.read().reference("next"),
        Some(Reference::Loaded(_))
    ));
    ctx.clear();
    assert_eq!(ctx.tracked_count(), 0);
    drop(head);
    assert_eq!(db.row_count("link"), CHAIN);
}
