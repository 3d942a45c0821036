//! Mock executor and entity fixtures shared by the unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use unitwork_core::{
    CascadeStyle, EntityType, GeneratedValues, IdGeneration, LinkTable, LockMode, MetadataModel,
    MetadataRegistry, PropertyInfo, Row, SqlError, SqlExecutor, SqlResult, Value,
};

#[derive(Debug, Default)]
pub struct MockState {
    /// (table, row) in insertion order.
    pub rows: Vec<(&'static str, Row)>,
    /// (link table, owner id, element id).
    pub links: Vec<(&'static str, Value, Value)>,
    /// One line per executed statement, e.g. `insert person`.
    pub statements: Vec<String>,
    pub next_id: i64,
    /// Returned by the next write.
    pub fail_next: Option<SqlError>,
}

#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    pub state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state.lock().expect("lock poisoned").statements.clear();
    }

    /// Statements other than reads.
    pub fn writes(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| !s.starts_with("select") && !s.starts_with("links?"))
            .collect()
    }

    pub fn row(&self, table: &str, id_column: &str, id: &Value) -> Option<Row> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .rows
            .iter()
            .find(|(t, r)| *t == table && r.get(id_column) == Some(id))
            .map(|(_, r)| r.clone())
    }

    pub fn put_row(&self, table: &'static str, row: Row) {
        self.state.lock().expect("lock poisoned").rows.push((table, row));
    }

    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.rows.iter().filter(|(t, _)| *t == table).count()
    }

    pub fn link_count(&self, table: &str) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.links.iter().filter(|(t, _, _)| *t == table).count()
    }

    pub fn fail_next(&self, error: SqlError) {
        self.state.lock().expect("lock poisoned").fail_next = Some(error);
    }

    /// Change a column behind the context's back.
    pub fn set_column(&self, table: &str, id: &Value, column: &str, value: Value) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some((_, row)) = state
            .rows
            .iter_mut()
            .find(|(t, r)| *t == table && r.get("id") == Some(id))
        {
            row.set(column, value);
        }
    }
}

fn matches_row(entity_type: &EntityType, table: &str, row: &Row, id: &Value) -> bool {
    table == entity_type.table && row.get(entity_type.id_column) == Some(id)
}

impl SqlExecutor for MockExecutor {
    fn insert(&self, entity_type: &EntityType, values: &[(&'static str, Value)]) -> SqlResult<GeneratedValues> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        let mut row = Row::from_columns(values.iter().map(|(c, v)| (*c, v.clone())));
        let mut generated = GeneratedValues::default();
        if entity_type.id_generation == IdGeneration::Generated {
            state.next_id += 1;
            let id = Value::BigInt(state.next_id);
            row.set(entity_type.id_column, id.clone());
            generated.id = Some(id);
        }
        state.statements.push(format!("insert {}", entity_type.table));
        state.rows.push((entity_type.table, row));
        Ok(generated)
    }

    fn update(
        &self,
        entity_type: &EntityType,
        id: &Value,
        changes: &[(&'static str, Value)],
        expected_version: Option<&Value>,
    ) -> SqlResult<u64> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        let columns: Vec<&str> = changes.iter().map(|(c, _)| *c).collect();
        state
            .statements
            .push(format!("update {} [{}]", entity_type.table, columns.join(",")));
        let Some((_, row)) = state
            .rows
            .iter_mut()
            .find(|(t, r)| matches_row(entity_type, t, r, id))
        else {
            return Ok(0);
        };
        if let (Some(column), Some(expected)) = (entity_type.version_column, expected_version) {
            if row.get(column) != Some(expected) {
                return Ok(0);
            }
        }
        for (column, value) in changes {
            row.set(*column, value.clone());
        }
        Ok(1)
    }

    fn delete(&self, entity_type: &EntityType, id: &Value, expected_version: Option<&Value>) -> SqlResult<u64> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        state.statements.push(format!("delete {}", entity_type.table));
        let Some(pos) = state
            .rows
            .iter()
            .position(|(t, r)| matches_row(entity_type, t, r, id))
        else {
            return Ok(0);
        };
        if let (Some(column), Some(expected)) = (entity_type.version_column, expected_version) {
            if state.rows[pos].1.get(column) != Some(expected) {
                return Ok(0);
            }
        }
        state.rows.remove(pos);
        Ok(1)
    }

    fn select_by_id(&self, entity_type: &EntityType, id: &Value) -> SqlResult<Option<Row>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.statements.push(format!("select {}", entity_type.table));
        Ok(state
            .rows
            .iter()
            .find(|(t, r)| matches_row(entity_type, t, r, id))
            .map(|(_, r)| r.clone()))
    }

    fn select_for_lock(
        &self,
        entity_type: &EntityType,
        id: &Value,
        mode: LockMode,
        _timeout: Option<Duration>,
    ) -> SqlResult<Option<Row>> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        state
            .statements
            .push(format!("lock {} {:?}", entity_type.table, mode));
        Ok(state
            .rows
            .iter()
            .find(|(t, r)| matches_row(entity_type, t, r, id))
            .map(|(_, r)| r.clone()))
    }

    fn select_by_column(&self, entity_type: &EntityType, column: &str, value: &Value) -> SqlResult<Vec<Row>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .statements
            .push(format!("select {} by {}", entity_type.table, column));
        Ok(state
            .rows
            .iter()
            .filter(|(t, r)| *t == entity_type.table && r.get(column) == Some(value))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn insert_links(&self, link: &LinkTable, owner: &Value, elements: &[Value]) -> SqlResult<u64> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        state.statements.push(format!("links+ {}", link.table));
        for element in elements {
            state.links.push((link.table, owner.clone(), element.clone()));
        }
        Ok(elements.len() as u64)
    }

    fn delete_links(&self, link: &LinkTable, owner: &Value, elements: Option<&[Value]>) -> SqlResult<u64> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        state.statements.push(format!("links- {}", link.table));
        let before = state.links.len();
        state.links.retain(|(t, o, e)| {
            !(*t == link.table && o == owner && elements.is_none_or(|list| list.contains(e)))
        });
        Ok((before - state.links.len()) as u64)
    }

    fn select_links(&self, link: &LinkTable, owner: &Value) -> SqlResult<Vec<Value>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.statements.push(format!("links? {}", link.table));
        Ok(state
            .links
            .iter()
            .filter(|(t, o, _)| *t == link.table && o == owner)
            .map(|(_, _, e)| e.clone())
            .collect())
    }
}

/// Person (versioned), Parent/Child (inverse collection with orphan
/// removal), Node (self reference), Link (self reference with cascade ALL),
/// A/B (mutual NOT NULL) and Hero/Power (link table).
pub fn metadata() -> Arc<dyn MetadataModel> {
    let mut registry = MetadataRegistry::new();
    let types = [
        EntityType::new("Person", "person")
            .versioned("version")
            .property(PropertyInfo::basic("name").nullable(false))
            .property(PropertyInfo::embedded("address")),
        EntityType::new("Parent", "parent")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::one_to_many("children", "Child", "parent")
                    .cascade(CascadeStyle::ALL)
                    .orphan_removal(true),
            ),
        EntityType::new("Child", "child")
            .property(PropertyInfo::basic("name"))
            .property(PropertyInfo::many_to_one("parent", "parent_id", "Parent").nullable(false)),
        EntityType::new("Node", "node")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_one("next", "next_id", "Node").cascade(CascadeStyle::PERSIST),
            ),
        EntityType::new("Link", "link")
            .property(PropertyInfo::basic("name"))
            .property(PropertyInfo::many_to_one("next", "next_id", "Link").cascade(CascadeStyle::ALL)),
        EntityType::new("A", "a").property(
            PropertyInfo::many_to_one("b", "b_id", "B")
                .nullable(false)
                .cascade(CascadeStyle::PERSIST),
        ),
        EntityType::new("B", "b").property(
            PropertyInfo::many_to_one("a", "a_id", "A")
                .nullable(false)
                .cascade(CascadeStyle::PERSIST),
        ),
        EntityType::new("Hero", "hero")
            .versioned("version")
            .property(PropertyInfo::basic("name"))
            .property(
                PropertyInfo::many_to_many(
                    "powers",
                    "Power",
                    LinkTable::new("hero_power", "hero_id", "power_id"),
                )
                .cascade(CascadeStyle::PERSIST),
            ),
        EntityType::new("Power", "power").property(PropertyInfo::basic("name")),
    ];
    for entity_type in types {
        registry.register(entity_type).expect("valid fixture");
    }
    registry.build().expect("valid fixture")
}

/// A stored person row.
pub fn person_row(id: i64, name: &str, version: i64) -> Row {
    let mut row = Row::new();
    row.set("id", Value::BigInt(id));
    row.set("version", Value::BigInt(version));
    row.set("name", Value::from(name));
    row
}
