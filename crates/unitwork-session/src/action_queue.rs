//! Action queue: ordering a flush's actions.
//!
//! Actions become nodes of a dependency graph whose edges mean "must run
//! before":
//!
//! - an insert waits for the inserts of the instances its foreign keys
//!   point at;
//! - a delete runs before the deletes of the instances its row points at;
//! - an update that points a foreign key at a new instance waits for that
//!   instance's insert, and an update moving a foreign key away from a
//!   deleted instance runs before that delete;
//! - link-table writes wait for the owner and element inserts, and link
//!   removals run before the owner and element deletes.
//!
//! The plan is a topological order that, among ready actions, prefers the
//! fixed subtype order (inserts, updates, collection removals, collection
//! updates, collection recreations, deletes) and then insertion order.
//!
//! A cycle is broken by deferring one foreign key: the insert writes NULL
//! and a post-insert update sets the key, or, for deletes, a pre-delete
//! update clears it. Ordering hints are dropped first, then nullable keys,
//! then non-nullable keys; ties go to the action queued first and then the
//! lowest property index. A cycle whose keys are all non-updatable is a
//! [`Error::CircularDependency`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use unitwork_core::{Error, InstanceId, Result};

use crate::action::{Action, EntityUpdateAction, ForeignKeyHint, UpdateKind};
use crate::dirty::PropertyChangeVector;

/// Pending action counts by subtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub collection_actions: usize,
}

/// Actions registered for one flush.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<Action>,
    delete_hints: Vec<(InstanceId, InstanceId)>,
    order_by_table: bool,
}

impl ActionQueue {
    pub fn new(order_by_table: bool) -> Self {
        Self {
            actions: Vec::new(),
            delete_hints: Vec::new(),
            order_by_table,
        }
    }

    pub fn add(&mut self, action: Action) {
        tracing::trace!(action = %action.describe(), "Action queued");
        self.actions.push(action);
    }

    /// Delete `first` before `second` when both are deleted in this flush.
    ///
    /// Hints are soft: a hint that closes a cycle is dropped.
    pub fn add_delete_order_hint(&mut self, first: InstanceId, second: InstanceId) {
        if first != second {
            self.delete_hints.push((first, second));
        }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn counts(&self) -> ActionCounts {
        let mut counts = ActionCounts::default();
        for action in &self.actions {
            match action {
                Action::Insert(_) => counts.inserts += 1,
                Action::Update(_) => counts.updates += 1,
                Action::Delete(_) => counts.deletes += 1,
                _ => counts.collection_actions += 1,
            }
        }
        counts
    }

    /// Whether any pending action writes one of `entity_types`.
    pub fn touches(&self, entity_types: &[&str]) -> bool {
        self.actions
            .iter()
            .any(|a| entity_types.contains(&a.entity_type()))
    }

    /// Order the queued actions, splitting foreign keys to break cycles.
    #[tracing::instrument(level = "debug", skip(self), fields(actions = self.actions.len()))]
    pub fn plan(self) -> Result<ExecutionPlan> {
        let start = Instant::now();
        let mut planner = Planner {
            nodes: self.actions,
            hints: self.delete_hints.into_iter().map(Some).collect(),
            order_by_table: self.order_by_table,
            splits: 0,
        };

        loop {
            let edges = planner.edges();
            match planner.topological_order(&edges) {
                Ok(order) => {
                    let plan = planner.finish(order);
                    tracing::debug!(
                        actions = plan.len(),
                        splits = plan.splits,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Execution plan ready"
                    );
                    return Ok(plan);
                }
                Err(indegree) => {
                    let cycle = planner.find_cycle(&edges, &indegree);
                    match planner.choose_break(&edges, &cycle) {
                        Some(edge) => planner.split(edge),
                        None => {
                            let cycle: Vec<String> =
                                cycle.iter().map(|&i| planner.nodes[i].describe()).collect();
                            tracing::warn!(cycle = ?cycle, "Unbreakable dependency cycle");
                            return Err(Error::CircularDependency { cycle });
                        }
                    }
                }
            }
        }
    }
}

/// Actions in execution order.
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    actions: Vec<Action>,
    splits: usize,
}

impl ExecutionPlan {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }

    /// Foreign keys deferred to break cycles.
    pub fn splits(&self) -> usize {
        self.splits
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Fixed,
    Hint(usize),
    InsertReference {
        property: usize,
        nullable: bool,
        updatable: bool,
    },
    DeleteReference {
        property: usize,
        nullable: bool,
        updatable: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    from: usize,
    to: usize,
    kind: EdgeKind,
}

fn fixed(edges: &mut Vec<Edge>, from: Option<&usize>, to: Option<&usize>) {
    if let (Some(&from), Some(&to)) = (from, to) {
        if from != to {
            edges.push(Edge {
                from,
                to,
                kind: EdgeKind::Fixed,
            });
        }
    }
}

struct Planner {
    nodes: Vec<Action>,
    hints: Vec<Option<(InstanceId, InstanceId)>>,
    order_by_table: bool,
    splits: usize,
}

impl Planner {
    fn edges(&self) -> Vec<Edge> {
        let mut inserts: HashMap<InstanceId, usize> = HashMap::new();
        let mut deletes: HashMap<InstanceId, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Action::Insert(_) => {
                    inserts.insert(node.instance(), i);
                }
                Action::Delete(_) => {
                    deletes.insert(node.instance(), i);
                }
                _ => {}
            }
        }

        let mut edges = Vec::new();

        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Action::Insert(insert) => {
                    for hint in &insert.references {
                        if insert.deferred.contains(&hint.property) {
                            continue;
                        }
                        if let Some(&target) = inserts.get(&hint.target) {
                            edges.push(Edge {
                                from: target,
                                to: i,
                                kind: EdgeKind::InsertReference {
                                    property: hint.property,
                                    nullable: hint.nullable,
                                    updatable: hint.updatable,
                                },
                            });
                        }
                    }
                }
                Action::Update(update) => {
                    for hint in &update.references {
                        fixed(&mut edges, inserts.get(&hint.target), Some(&i));
                    }
                    for previous in &update.previous_references {
                        fixed(&mut edges, Some(&i), deletes.get(previous));
                    }
                    let own = update.entity.instance_id();
                    match update.kind {
                        UpdateKind::PostInsert => fixed(&mut edges, inserts.get(&own), Some(&i)),
                        UpdateKind::PreDelete => fixed(&mut edges, Some(&i), deletes.get(&own)),
                        UpdateKind::Dirty | UpdateKind::VersionIncrement => {}
                    }
                }
                Action::Delete(delete) => {
                    let own = delete.entity.instance_id();
                    for hint in &delete.references {
                        // A row referencing itself is deleted by one statement.
                        if hint.target == own || delete.deferred.contains(&hint.property) {
                            continue;
                        }
                        if let Some(&target) = deletes.get(&hint.target) {
                            edges.push(Edge {
                                from: i,
                                to: target,
                                kind: EdgeKind::DeleteReference {
                                    property: hint.property,
                                    nullable: hint.nullable,
                                    updatable: hint.updatable,
                                },
                            });
                        }
                    }
                }
                Action::CollectionRecreate(c) | Action::CollectionUpdate(c) => {
                    fixed(&mut edges, inserts.get(&c.owner.instance_id()), Some(&i));
                    for element in &c.added {
                        fixed(&mut edges, inserts.get(&element.instance_id()), Some(&i));
                    }
                    for element in &c.removed {
                        fixed(&mut edges, Some(&i), deletes.get(&element.instance_id()));
                    }
                }
                Action::CollectionRemove(c) => {
                    fixed(&mut edges, Some(&i), deletes.get(&c.owner.instance_id()));
                    for element in &c.removed {
                        fixed(&mut edges, Some(&i), deletes.get(&element.instance_id()));
                    }
                }
            }
        }

        for (k, hint) in self.hints.iter().enumerate() {
            let Some((first, second)) = hint else {
                continue;
            };
            if let (Some(&from), Some(&to)) = (deletes.get(first), deletes.get(second)) {
                edges.push(Edge {
                    from,
                    to,
                    kind: EdgeKind::Hint(k),
                });
            }
        }
        edges
    }

    fn priority(&self, index: usize) -> (u8, &'static str, usize) {
        let node = &self.nodes[index];
        let table = if self.order_by_table {
            node.entity_type()
        } else {
            ""
        };
        (node.rank(), table, index)
    }

    /// Kahn's algorithm. On a cycle, returns the residual in-degrees: nodes
    /// with a non-zero count are on or behind a cycle.
    fn topological_order(&self, edges: &[Edge]) -> std::result::Result<Vec<usize>, Vec<usize>> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in edges {
            indegree[edge.to] += 1;
            successors[edge.from].push(edge.to);
        }

        let mut ready: BinaryHeap<Reverse<(u8, &'static str, usize)>> = (0..n)
            .filter(|&i| indegree[i] == 0)
            .map(|i| Reverse(self.priority(i)))
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, _, i))) = ready.pop() {
            order.push(i);
            for &next in &successors[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse(self.priority(next)));
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            Err(indegree)
        }
    }

    /// A cycle among the stalled nodes, in edge direction.
    fn find_cycle(&self, edges: &[Edge], indegree: &[usize]) -> Vec<usize> {
        let mut predecessors: HashMap<usize, Vec<usize>> = HashMap::new();
        for edge in edges {
            if indegree[edge.from] > 0 && indegree[edge.to] > 0 {
                predecessors.entry(edge.to).or_default().push(edge.from);
            }
        }

        let Some(start) = (0..indegree.len()).find(|&i| indegree[i] > 0) else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        loop {
            let current = path[path.len() - 1];
            let Some(&previous) = predecessors
                .get(&current)
                .and_then(|p| p.iter().min_by_key(|&&p| (self.nodes[p].rank(), p)))
            else {
                return path;
            };
            if let Some(&at) = position.get(&previous) {
                let mut cycle = path.split_off(at);
                cycle.reverse();
                return cycle;
            }
            position.insert(previous, path.len());
            path.push(previous);
        }
    }

    fn choose_break(&self, edges: &[Edge], cycle: &[usize]) -> Option<Edge> {
        let mut best: Option<((u8, usize, usize), Edge)> = None;
        for (k, &from) in cycle.iter().enumerate() {
            let to = cycle[(k + 1) % cycle.len()];
            for edge in edges.iter().filter(|e| e.from == from && e.to == to) {
                let key = match edge.kind {
                    EdgeKind::Fixed => continue,
                    EdgeKind::Hint(_) => (0, edge.to, 0),
                    EdgeKind::InsertReference {
                        property,
                        nullable,
                        updatable,
                    } => {
                        if !updatable {
                            continue;
                        }
                        (if nullable { 1 } else { 2 }, edge.to, property)
                    }
                    EdgeKind::DeleteReference {
                        property,
                        nullable,
                        updatable,
                    } => {
                        if !updatable {
                            continue;
                        }
                        (if nullable { 1 } else { 2 }, edge.from, property)
                    }
                };
                if best.as_ref().is_none_or(|(current, _)| key < *current) {
                    best = Some((key, *edge));
                }
            }
        }
        best.map(|(_, edge)| edge)
    }

    fn split(&mut self, edge: Edge) {
        match edge.kind {
            EdgeKind::Fixed => {}
            EdgeKind::Hint(k) => {
                tracing::debug!(hint = k, "Dropped delete order hint closing a cycle");
                self.hints[k] = None;
            }
            EdgeKind::InsertReference { property, .. } => {
                let Action::Insert(insert) = &mut self.nodes[edge.to] else {
                    return;
                };
                insert.deferred.push(property);
                let entity = insert.entity.clone();
                let hint = insert
                    .references
                    .iter()
                    .find(|h| h.property == property)
                    .copied();
                tracing::debug!(
                    entity = entity.entity_type(),
                    instance = %entity.instance_id(),
                    property,
                    "Foreign key deferred to a post-insert update"
                );
                self.splits += 1;
                self.attach_update(entity, UpdateKind::PostInsert, property, hint);
            }
            EdgeKind::DeleteReference { property, .. } => {
                let Action::Delete(delete) = &mut self.nodes[edge.from] else {
                    return;
                };
                delete.deferred.push(property);
                let entity = delete.entity.clone();
                let hint = delete
                    .references
                    .iter()
                    .find(|h| h.property == property)
                    .copied();
                tracing::debug!(
                    entity = entity.entity_type(),
                    instance = %entity.instance_id(),
                    property,
                    "Foreign key cleared by a pre-delete update"
                );
                self.splits += 1;
                self.attach_update(entity, UpdateKind::PreDelete, property, hint);
            }
        }
    }

    /// Add `property` to the split update of `entity`, creating it if needed.
    fn attach_update(
        &mut self,
        entity: unitwork_core::EntityRef,
        kind: UpdateKind,
        property: usize,
        hint: Option<ForeignKeyHint>,
    ) {
        let existing = self.nodes.iter().position(|node| {
            matches!(node, Action::Update(update) if update.kind == kind && update.entity.ptr_eq(&entity))
        });
        let index = match existing {
            Some(index) => index,
            None => {
                self.nodes.push(Action::Update(EntityUpdateAction {
                    entity,
                    kind,
                    changed: PropertyChangeVector::new(),
                    references: Vec::new(),
                    previous_references: Vec::new(),
                }));
                self.nodes.len() - 1
            }
        };
        let Action::Update(update) = &mut self.nodes[index] else {
            return;
        };
        update.changed.push(property);
        if let Some(hint) = hint {
            match kind {
                UpdateKind::PreDelete => update.previous_references.push(hint.target),
                _ => update.references.push(hint),
            }
        }
    }

    fn finish(self, order: Vec<usize>) -> ExecutionPlan {
        let mut slots: Vec<Option<Action>> = self.nodes.into_iter().map(Some).collect();
        let actions = order
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .collect();
        ExecutionPlan {
            actions,
            splits: self.splits,
        }
    }
}
