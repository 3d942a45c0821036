//! Cascade resolution.
//!
//! Walks an entity graph breadth first from one or more roots, following
//! only the associations whose cascade style includes the requested
//! operation. The visited set is keyed by [`InstanceId`] so transient
//! instances, which have no key yet, are visited once and cyclic graphs
//! terminate.

use std::collections::{HashSet, VecDeque};

use unitwork_core::{CascadeOp, EntityRef, InstanceId, PropertyValue, Reference, Result};

use crate::entry::EntityStatus;

/// Access to context state needed while walking associations.
///
/// Only `Remove` loads unloaded associations: deleting a parent must reach
/// every child row. The other operations stop at unloaded values.
pub trait AssociationLoader {
    /// Status of a tracked instance, `None` when untracked.
    fn status_of(&self, instance: InstanceId) -> Option<EntityStatus>;

    /// Resolve an unloaded to-one association of `owner`.
    fn load_reference(&mut self, owner: &EntityRef, property: usize) -> Result<Option<EntityRef>>;

    /// Read the elements of an uninitialized collection of `owner`.
    fn initialize_collection(&mut self, owner: &EntityRef, property: usize) -> Result<Vec<EntityRef>>;
}

/// Association an instance was reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeEdge {
    pub from: InstanceId,
    pub property: usize,
    pub to_many: bool,
}

/// One instance the operation applies to.
#[derive(Debug, Clone)]
pub struct CascadeTarget {
    pub instance: EntityRef,
    /// `None` for roots.
    pub via: Option<CascadeEdge>,
}

/// A non-cascaded to-one association pointing at a transient instance.
#[derive(Debug, Clone)]
pub struct TransientReference {
    pub owner: EntityRef,
    pub property: &'static str,
    pub target: EntityRef,
    pub nullable: bool,
}

/// Result of one cascade walk.
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    /// Visited instances in visit order, roots first.
    pub targets: Vec<CascadeTarget>,
    /// Transient targets found on `Persist` walks.
    pub transient_references: Vec<TransientReference>,
}

impl CascadeOutcome {
    pub fn instances(&self) -> impl Iterator<Item = &EntityRef> {
        self.targets.iter().map(|t| &t.instance)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Statuses at which `op` stops: the target is skipped, not re-queued.
const fn is_terminal(op: CascadeOp, status: EntityStatus) -> bool {
    match op {
        CascadeOp::Persist => matches!(status, EntityStatus::Gone),
        CascadeOp::Merge => false,
        CascadeOp::Remove | CascadeOp::Refresh | CascadeOp::Lock => {
            matches!(status, EntityStatus::Deleted | EntityStatus::Gone)
        }
    }
}

/// Breadth-first cascade of `op` from `roots`.
///
/// Roots are always part of the outcome; the caller validates their status.
#[tracing::instrument(level = "trace", skip(roots, loader), fields(roots = roots.len()))]
pub fn cascade(
    op: CascadeOp,
    roots: &[EntityRef],
    loader: &mut dyn AssociationLoader,
) -> Result<CascadeOutcome> {
    let mut outcome = CascadeOutcome::default();
    let mut visited: HashSet<InstanceId> = HashSet::new();
    let mut queue: VecDeque<(EntityRef, Option<CascadeEdge>)> = VecDeque::new();

    for root in roots {
        if visited.insert(root.instance_id()) {
            queue.push_back((root.clone(), None));
        }
    }

    while let Some((entity, via)) = queue.pop_front() {
        tracing::trace!(op = op.as_str(), entity = ?entity, "Cascade visit");
        let (descriptor, values) = {
            let guard = entity.read();
            (guard.descriptor().clone(), guard.values().to_vec())
        };

        for index in descriptor.association_indexes() {
            let Some(property) = descriptor.property_at(index) else {
                continue;
            };
            let cascades = property.cascades(op);
            let reached: Vec<EntityRef> = match values.get(index) {
                Some(PropertyValue::Reference(reference)) => {
                    if !cascades {
                        if op == CascadeOp::Persist {
                            if let Reference::Loaded(target) = reference {
                                if loader.status_of(target.instance_id()).is_none()
                                    && target.id().is_null()
                                {
                                    outcome.transient_references.push(TransientReference {
                                        owner: entity.clone(),
                                        property: property.name,
                                        target: target.clone(),
                                        nullable: property.nullable,
                                    });
                                }
                            }
                        }
                        continue;
                    }
                    match reference {
                        Reference::Null => continue,
                        Reference::Loaded(target) => vec![target.clone()],
                        Reference::Unloaded(_) if op == CascadeOp::Remove => {
                            loader.load_reference(&entity, index)?.into_iter().collect()
                        }
                        Reference::Unloaded(_) => continue,
                    }
                }
                Some(PropertyValue::Collection(collection)) => {
                    if !cascades {
                        continue;
                    }
                    if collection.is_initialized() {
                        collection.elements().to_vec()
                    } else if op == CascadeOp::Remove {
                        loader.initialize_collection(&entity, index)?
                    } else {
                        continue;
                    }
                }
                _ => continue,
            };

            let edge = CascadeEdge {
                from: entity.instance_id(),
                property: index,
                to_many: property.is_collection(),
            };
            for target in reached {
                if !visited.insert(target.instance_id()) {
                    continue;
                }
                if loader
                    .status_of(target.instance_id())
                    .is_some_and(|status| is_terminal(op, status))
                {
                    tracing::trace!(op = op.as_str(), target = ?target, "Cascade skipped terminal instance");
                    continue;
                }
                queue.push_back((target, Some(edge)));
            }
        }

        outcome.targets.push(CascadeTarget {
            instance: entity,
            via,
        });
    }

    tracing::trace!(op = op.as_str(), reached = outcome.targets.len(), "Cascade complete");
    Ok(outcome)
}
