//! Shared entity model and helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use unitwork::prelude::*;
use unitwork::Row;

/// The entity model every integration test maps:
///
/// - `Person`: versioned, NOT NULL name
/// - `Member`: unversioned
/// - `Department` / `Employee`: inverse collection with cascade ALL and
///   orphan removal over a NOT NULL foreign key
/// - `Husband` / `Wife`: mutual NOT NULL references with cascade PERSIST
/// - `Category`: nullable self reference
/// - `Student` / `Course`: link-table collection on a versioned owner
/// - `Vertex`: two nullable self references with cascade PERSIST
/// - `Link`: a nullable `next` self reference with cascade ALL
pub fn metadata() -> Arc<dyn MetadataModel> {
    let mut registry = MetadataRegistry::new();
    let types = [
        EntityType::new("Person", "person")
            .versioned("version")
            .property(PropertyInfo::basic("name").nullable(false)),
        EntityType::new("Member", "member").property(PropertyInfo::basic("name")),
        EntityType::new("Department", "department")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::one_to_many("employees", "Employee", "department")
                    .cascade(CascadeStyle::ALL)
                    .orphan_removal(true),
            ),
        EntityType::new("Employee", "employee")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_one("department", "department_id", "Department")
                    .nullable(false),
            ),
        EntityType::new("Husband", "husband")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_one("wife", "wife_id", "Wife")
                    .nullable(false)
                    .cascade(CascadeStyle::PERSIST),
            ),
        EntityType::new("Wife", "wife")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_one("husband", "husband_id", "Husband")
                    .nullable(false)
                    .cascade(CascadeStyle::PERSIST),
            ),
        EntityType::new("Category", "category")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_one("parent", "parent_id", "Category")
                    .cascade(CascadeStyle::PERSIST),
            ),
        EntityType::new("Student", "student")
            .versioned("version")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_many(
                    "courses",
                    "Course",
                    LinkTable::new("enrollment", "student_id", "course_id"),
                )
                .cascade(CascadeStyle::PERSIST),
            ),
        EntityType::new("Course", "course").property(PropertyInfo::basic("title")),
        EntityType::new("Vertex", "vertex")
            .property(PropertyInfo::basic("label"))
            .property(PropertyInfo::many_to_one("left", "left_id", "Vertex").cascade(CascadeStyle::PERSIST))
            .property(PropertyInfo::many_to_one("right", "right_id", "Vertex").cascade(CascadeStyle::PERSIST)),
        EntityType::new("Link", "link")
            .property(PropertyInfo::basic("label"))
            .property(PropertyInfo::many_to_one("next", "next_id", "Link").cascade(CascadeStyle::ALL)),
    ];
    for entity_type in types {
        registry.register(entity_type).expect("valid entity type");
    }
    registry.build().expect("valid metadata")
}

pub fn setup() -> (Arc<dyn MetadataModel>, MemoryDatabase) {
    let metadata = metadata();
    let db = MemoryDatabase::new(metadata.as_ref());
    (metadata, db)
}

pub fn context(metadata: &Arc<dyn MetadataModel>, db: &MemoryDatabase) -> PersistenceContext<MemoryConnection> {
    PersistenceContext::new(Arc::clone(metadata), db.connect())
}

/// Writes reduced to `verb table`, e.g. `insert person`.
pub fn write_summary(db: &MemoryDatabase) -> Vec<String> {
    db.writes()
        .iter()
        .map(|sql| {
            let words: Vec<&str> = sql.split_whitespace().collect();
            match words.as_slice() {
                ["INSERT", "INTO", table, ..] | ["DELETE", "FROM", table, ..] => {
                    format!("{} {}", words[0].to_lowercase(), table)
                }
                ["UPDATE", table, ..] => format!("update {table}"),
                _ => sql.clone(),
            }
        })
        .collect()
}

pub fn person_row(id: i64, name: &str, version: i64) -> Row {
    Row::from_columns([
        ("id", Value::BigInt(id)),
        ("version", Value::BigInt(version)),
        ("name", Value::from(name)),
    ])
}

pub fn named_row(id: i64, name: &str) -> Row {
    Row::from_columns([("id", Value::BigInt(id)), ("name", Value::from(name))])
}

/// Department 1 with employees 10 and 11.
pub fn seed_department(db: &MemoryDatabase) {
    db.insert_row("department", named_row(1, "Research"));
    for (id, name) in [(10, "Ivo"), (11, "Ena")] {
        let mut row = named_row(id, name);
        row.set("department_id", Value::BigInt(1));
        db.insert_row("employee", row);
    }
}

pub fn new_named(ctx: &PersistenceContext<MemoryConnection>, entity_type: &str, name: &str) -> EntityRef {
    let entity = ctx.instantiate(entity_type).expect("registered type");
    entity.write().set("name", name).expect("name property");
    entity
}

/// A chain of `len` links, each pointing at the next; returns the head only.
pub fn link_chain(ctx: &PersistenceContext<MemoryConnection>, len: usize) -> EntityRef {
    let mut head: Option<EntityRef> = None;
    for i in (0..len).rev() {
        let link = ctx.instantiate("Link").expect("registered type");
        {
            let mut guard = link.write();
            guard.set("label", format!("link {i}")).expect("label property");
            guard.set_reference("next", head.as_ref()).expect("next property");
        }
        head = Some(link);
    }
    head.expect("non-empty chain")
}
