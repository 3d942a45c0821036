//! Property tests over identity, cascade reachability and insert ordering.

mod common;

use std::collections::{BTreeSet, HashMap, VecDeque};

use common::{context, new_named, person_row, setup};
use proptest::prelude::*;
use unitwork::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Find(i64),
    Evict(i64),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1i64..=4).prop_map(Op::Find),
        2 => (1i64..=4).prop_map(Op::Evict),
        1 => Just(Op::Clear),
    ]
}

/// `(left, right)` child indexes per vertex; targets may form cycles.
fn graph() -> impl Strategy<Value = Vec<(Option<usize>, Option<usize>)>> {
    (1usize..8).prop_flat_map(|n| {
        prop::collection::vec(
            (prop::option::of(0..n), prop::option::of(0..n)),
            n,
        )
    })
}

fn reachable(edges: &[(Option<usize>, Option<usize>)]) -> BTreeSet<usize> {
    let mut seen = BTreeSet::from([0]);
    let mut queue = VecDeque::from([0]);
    while let Some(node) = queue.pop_front() {
        let (left, right) = edges[node];
        for next in [left, right].into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Employee `i` works in department `assignments[i]`, persisted in `order`.
fn staffing() -> impl Strategy<Value = (usize, Vec<usize>, Vec<usize>)> {
    (1usize..4, 1usize..6).prop_flat_map(|(departments, employees)| {
        let order: Vec<usize> = (0..departments + employees).collect();
        (
            Just(departments),
            prop::collection::vec(0..departments, employees),
            Just(order).prop_shuffle(),
        )
    })
}

proptest! {
    #[test]
    fn one_instance_per_key(ops in prop::collection::vec(op(), 1..40)) {
        let (metadata, db) = setup();
        for id in 1..=4 {
            db.insert_row("person", person_row(id, "p", 0));
        }
        let mut ctx = context(&metadata, &db);
        let mut expected: HashMap<i64, EntityRef> = HashMap::new();

        for op in ops {
            match op {
                Op::Find(id) => {
                    let found = ctx.find("Person", id).unwrap().unwrap();
                    match expected.get(&id) {
                        Some(known) => prop_assert!(known.ptr_eq(&found)),
                        None => {
                            prop_assert!(expected.values().all(|e| !e.ptr_eq(&found)));
                            expected.insert(id, found);
                        }
                    }
                }
                Op::Evict(id) => {
                    if let Some(entity) = expected.remove(&id) {
                        ctx.evict(&entity);
                        prop_assert!(!ctx.contains(&entity));
                    }
                }
                Op::Clear => {
                    ctx.clear();
                    expected.clear();
                }
            }
            prop_assert_eq!(ctx.tracked_count(), expected.len());
        }
        prop_assert!(ctx.flush().unwrap().is_empty());
    }

    #[test]
    fn persist_cascade_inserts_exactly_the_reachable_graph(edges in graph()) {
        let (metadata, db) = setup();
        let mut ctx = context(&metadata, &db);
        let vertices: Vec<EntityRef> = (0..edges.len())
            .map(|i| {
                let vertex = ctx.instantiate("Vertex").unwrap();
                vertex.write().set("label", format!("v{i}")).unwrap();
                vertex
            })
            .collect();
        for (vertex, &(left, right)) in vertices.iter().zip(&edges) {
            let mut guard = vertex.write();
            guard.set_reference("left", left.map(|i| &vertices[i])).unwrap();
            guard.set_reference("right", right.map(|i| &vertices[i])).unwrap();
        }

        ctx.persist(&vertices[0]).unwrap();
        let result = ctx.flush().unwrap();
        let expected = reachable(&edges);

        prop_assert_eq!(result.inserted, expected.len());
        prop_assert_eq!(db.row_count("vertex"), expected.len());
        for (i, vertex) in vertices.iter().enumerate() {
            prop_assert_eq!(ctx.contains(vertex), expected.contains(&i));
            prop_assert_eq!(vertex.id().is_null(), !expected.contains(&i));
        }
        for &i in &expected {
            let row = db.row("vertex", vertices[i].id()).unwrap();
            let (left, right) = edges[i];
            for (column, target) in [("left_id", left), ("right_id", right)] {
                let stored = row.get(column).cloned().unwrap_or(Value::Null);
                let wanted = target.map_or(Value::Null, |t| vertices[t].id());
                prop_assert_eq!(stored, wanted);
            }
        }
        prop_assert!(ctx.flush().unwrap().is_empty());
    }

    #[test]
    fn inserts_satisfy_foreign_keys_in_any_persist_order(
        (departments, assignments, order) in staffing()
    ) {
        let (metadata, db) = setup();
        let mut ctx = context(&metadata, &db);
        let owners: Vec<EntityRef> = (0..departments)
            .map(|i| new_named(&ctx, "Department", &format!("d{i}")))
            .collect();
        let staff: Vec<EntityRef> = assignments
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                let employee = new_named(&ctx, "Employee", &format!("e{i}"));
                employee.write().set_reference("department", Some(&owners[d])).unwrap();
                employee
            })
            .collect();

        for index in order {
            let entity = if index < departments {
                &owners[index]
            } else {
                &staff[index - departments]
            };
            ctx.persist(entity).unwrap();
        }
        let result = ctx.flush().unwrap();

        prop_assert_eq!(result.inserted, departments + assignments.len());
        prop_assert_eq!(result.post_insert_updates, 0);
        for (employee, &d) in staff.iter().zip(&assignments) {
            let row = db.row("employee", employee.id()).unwrap();
            prop_assert_eq!(row.get("department_id"), Some(&owners[d].id()));
        }
    }
}
