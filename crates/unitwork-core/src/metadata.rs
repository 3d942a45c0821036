//! Entity metadata model.
//!
//! Entity types are described once, at bootstrap, and shared read-only by
//! every persistence context. A description lists the table, identifier and
//! version columns, and the ordered property list. The property order is the
//! index order used by [`Entity`](crate::Entity) values, snapshots and change
//! vectors.
//!
//! # Example
//!
//! ```
//! use unitwork_core::{CascadeStyle, EntityType, MetadataRegistry, PropertyInfo};
//!
//! let mut registry = MetadataRegistry::new();
//! registry
//!     .register(
//!         EntityType::new("Team", "team")
//!             .property(PropertyInfo::basic("name").nullable(false))
//!             .property(PropertyInfo::one_to_many("heroes", "Hero", "team").cascade(CascadeStyle::ALL)),
//!     )
//!     .unwrap();
//! registry
//!     .register(
//!         EntityType::new("Hero", "hero")
//!             .versioned("version")
//!             .property(PropertyInfo::basic("name"))
//!             .property(PropertyInfo::many_to_one("team", "team_id", "Team")),
//!     )
//!     .unwrap();
//! let metadata = registry.build().unwrap();
//! assert_eq!(metadata.entity_names(), vec!["Team", "Hero"]);
//! ```

use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::entity::{Entity, EntityRef};
use crate::error::{Error, Result};
use crate::value::Value;

/// An operation that can propagate across associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Merge,
    Remove,
    Refresh,
    Lock,
}

impl CascadeOp {
    const fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 1,
            CascadeOp::Merge => 1 << 1,
            CascadeOp::Remove => 1 << 2,
            CascadeOp::Refresh => 1 << 3,
            CascadeOp::Lock => 1 << 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeOp::Persist => "persist",
            CascadeOp::Merge => "merge",
            CascadeOp::Remove => "remove",
            CascadeOp::Refresh => "refresh",
            CascadeOp::Lock => "lock",
        }
    }
}

/// Set of operations an association cascades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CascadeStyle(u8);

impl CascadeStyle {
    pub const NONE: Self = Self(0);
    pub const PERSIST: Self = Self(CascadeOp::Persist.bit());
    pub const MERGE: Self = Self(CascadeOp::Merge.bit());
    pub const REMOVE: Self = Self(CascadeOp::Remove.bit());
    pub const REFRESH: Self = Self(CascadeOp::Refresh.bit());
    pub const LOCK: Self = Self(CascadeOp::Lock.bit());
    pub const ALL: Self = Self(0b1_1111);

    /// Combine two styles.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether this style propagates `op`.
    pub const fn includes(self, op: CascadeOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CascadeStyle {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Link (join) table backing an owned many-to-many collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTable {
    /// Link table name (e.g. `"hero_powers"`).
    pub table: &'static str,
    /// Column pointing at the collection owner.
    pub owner_column: &'static str,
    /// Column pointing at the element.
    pub element_column: &'static str,
}

impl LinkTable {
    pub const fn new(
        table: &'static str,
        owner_column: &'static str,
        element_column: &'static str,
    ) -> Self {
        Self {
            table,
            owner_column,
            element_column,
        }
    }
}

/// How the rows of a collection are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMapping {
    /// Mapped by a to-one property of the element; the element's foreign
    /// key is the source of truth and the collection emits no SQL.
    Inverse { mapped_by: &'static str },
    /// Owned collection stored in a link table.
    LinkTable(LinkTable),
}

/// Shape of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Single column scalar.
    Basic,
    /// Value object compared by deep equality, stored as one JSON column.
    Embedded,
    /// Many-to-one or one-to-one association holding a foreign key column.
    ToOne { target: &'static str },
    /// One-to-many or many-to-many association.
    ToMany {
        target: &'static str,
        mapping: CollectionMapping,
    },
}

/// Metadata describing one entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property name.
    pub name: &'static str,
    /// Column name (foreign key column for to-one associations).
    pub column: &'static str,
    pub kind: PropertyKind,
    /// Operations propagated across this association.
    pub cascade: CascadeStyle,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether the column is written on insert.
    pub insertable: bool,
    /// Whether the column may be written after insert, including the
    /// post-insert update that breaks a foreign key cycle.
    pub updatable: bool,
    /// Mutable properties take part in dirty checking.
    pub mutable: bool,
    /// Delete elements (or the referenced instance) once dereferenced.
    pub orphan_removal: bool,
}

impl PropertyInfo {
    const fn with_kind(name: &'static str, column: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            column,
            kind,
            cascade: CascadeStyle::NONE,
            nullable: true,
            insertable: true,
            updatable: true,
            mutable: true,
            orphan_removal: false,
        }
    }

    /// Scalar property stored in a column of the same name.
    pub const fn basic(name: &'static str) -> Self {
        Self::with_kind(name, name, PropertyKind::Basic)
    }

    /// Embedded value object stored in a column of the same name.
    pub const fn embedded(name: &'static str) -> Self {
        Self::with_kind(name, name, PropertyKind::Embedded)
    }

    /// Many-to-one association through foreign key `column`.
    pub const fn many_to_one(name: &'static str, column: &'static str, target: &'static str) -> Self {
        Self::with_kind(name, column, PropertyKind::ToOne { target })
    }

    /// One-to-one association owning foreign key `column`.
    pub const fn one_to_one(name: &'static str, column: &'static str, target: &'static str) -> Self {
        Self::many_to_one(name, column, target)
    }

    /// Inverse one-to-many collection mapped by `mapped_by` on the target.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        Self::with_kind(
            name,
            name,
            PropertyKind::ToMany {
                target,
                mapping: CollectionMapping::Inverse { mapped_by },
            },
        )
    }

    /// Owned collection stored in a link table.
    pub const fn many_to_many(name: &'static str, target: &'static str, link: LinkTable) -> Self {
        Self::with_kind(
            name,
            name,
            PropertyKind::ToMany {
                target,
                mapping: CollectionMapping::LinkTable(link),
            },
        )
    }

    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    /// Exclude the property from dirty checking.
    pub const fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub const fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    pub const fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    pub const fn is_association(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::ToOne { .. } | PropertyKind::ToMany { .. }
        )
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::ToMany { .. })
    }

    /// Whether the property maps to a column of the entity's own table.
    pub const fn has_column(&self) -> bool {
        !self.is_collection()
    }

    /// Associated entity type, if this is an association.
    pub const fn target(&self) -> Option<&'static str> {
        match self.kind {
            PropertyKind::ToOne { target } | PropertyKind::ToMany { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Link table of an owned collection.
    pub const fn link_table(&self) -> Option<LinkTable> {
        match self.kind {
            PropertyKind::ToMany {
                mapping: CollectionMapping::LinkTable(link),
                ..
            } => Some(link),
            _ => None,
        }
    }

    pub const fn is_inverse(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::ToMany {
                mapping: CollectionMapping::Inverse { .. },
                ..
            }
        )
    }

    pub const fn cascades(&self, op: CascadeOp) -> bool {
        self.cascade.includes(op)
    }
}

/// Identifier generation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdGeneration {
    /// Generated by the database on insert.
    #[default]
    Generated,
    /// Supplied by the application before persist.
    Assigned,
}

/// Metadata describing one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    pub name: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub id_generation: IdGeneration,
    /// Optimistic-lock version column.
    pub version_column: Option<&'static str>,
    /// Immutable types are never updated after insert.
    pub mutable: bool,
    properties: Vec<PropertyInfo>,
}

impl EntityType {
    /// New entity type with a generated `id` column and no properties.
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            id_column: "id",
            id_generation: IdGeneration::Generated,
            version_column: None,
            mutable: true,
            properties: Vec::new(),
        }
    }

    pub fn id(mut self, column: &'static str, generation: IdGeneration) -> Self {
        self.id_column = column;
        self.id_generation = generation;
        self
    }

    pub fn versioned(mut self, column: &'static str) -> Self {
        self.version_column = Some(column);
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Append a property; its index is its position in declaration order.
    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    pub fn properties(&self) -> &[PropertyInfo] {
        &self.properties
    }

    pub fn property_at(&self, index: usize) -> Option<&PropertyInfo> {
        self.properties.get(index)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn property_named(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub const fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    /// Indexes of association properties.
    pub fn association_indexes(&self) -> impl Iterator<Item = usize> + '_ {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_association())
            .map(|(i, _)| i)
    }
}

/// Read-only access to entity metadata.
///
/// Implementations must be safe to share across persistence contexts.
pub trait MetadataModel: Send + Sync {
    /// Look up an entity type by name.
    fn entity_type(&self, name: &str) -> Option<Arc<EntityType>>;

    /// All entity types in registration order.
    fn entity_types(&self) -> Vec<Arc<EntityType>>;

    /// Look up an entity type, failing with `UnknownEntityType`.
    fn require(&self, name: &str) -> Result<Arc<EntityType>> {
        self.entity_type(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    /// Identifier of an instance (NULL while unassigned).
    fn identifier(&self, entity: &Entity) -> Value {
        entity.id().clone()
    }

    /// Version of an instance, or `None` for unversioned types.
    fn version(&self, entity: &Entity) -> Option<Value> {
        entity
            .descriptor()
            .is_versioned()
            .then(|| entity.version().clone())
    }

    /// Ordered property list of an entity type.
    fn properties(&self, name: &str) -> Result<Vec<PropertyInfo>> {
        Ok(self.require(name)?.properties().to_vec())
    }

    /// Create a new transient instance of an entity type.
    fn instantiate(&self, name: &str) -> Result<EntityRef> {
        Ok(EntityRef::new(Entity::new(self.require(name)?)))
    }
}

fn identifier_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
        .as_ref()
        .map_err(|e| Error::InvalidMetadata(format!("identifier pattern: {e}")))
}

fn check_identifier(what: &str, owner: &str, ident: &str) -> Result<()> {
    if identifier_pattern()?.is_match(ident) {
        Ok(())
    } else {
        Err(Error::InvalidMetadata(format!(
            "{owner}: invalid {what} name '{ident}'"
        )))
    }
}

/// In-memory [`MetadataModel`] assembled at bootstrap.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    types: HashMap<&'static str, Arc<EntityType>>,
    order: Vec<&'static str>,
}

impl MetadataRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type after checking its names.
    pub fn register(&mut self, entity_type: EntityType) -> Result<Arc<EntityType>> {
        let name = entity_type.name;
        check_identifier("entity", name, name)?;
        check_identifier("table", name, entity_type.table)?;
        check_identifier("id column", name, entity_type.id_column)?;
        if let Some(version) = entity_type.version_column {
            check_identifier("version column", name, version)?;
        }
        for (i, property) in entity_type.properties().iter().enumerate() {
            check_identifier("property", name, property.name)?;
            if property.has_column() {
                check_identifier("column", name, property.column)?;
            }
            if entity_type.properties()[..i]
                .iter()
                .any(|p| p.name == property.name)
            {
                return Err(Error::InvalidMetadata(format!(
                    "{name}: duplicate property '{}'",
                    property.name
                )));
            }
            if property.orphan_removal && !property.is_association() {
                return Err(Error::InvalidMetadata(format!(
                    "{name}.{}: orphan removal requires an association",
                    property.name
                )));
            }
        }
        if self.types.contains_key(name) {
            return Err(Error::InvalidMetadata(format!(
                "entity type '{name}' registered twice"
            )));
        }

        tracing::debug!(
            entity = name,
            table = entity_type.table,
            properties = entity_type.properties().len(),
            "Registered entity type"
        );
        let shared = Arc::new(entity_type);
        self.types.insert(name, Arc::clone(&shared));
        self.order.push(name);
        Ok(shared)
    }

    /// Check cross-type references and freeze the registry.
    pub fn build(self) -> Result<Arc<Self>> {
        for name in &self.order {
            let owner = &self.types[name];
            for property in owner.properties() {
                let Some(target) = property.target() else {
                    continue;
                };
                let Some(target_type) = self.types.get(target) else {
                    return Err(Error::InvalidMetadata(format!(
                        "{name}.{}: unknown target entity '{target}'",
                        property.name
                    )));
                };
                if let PropertyKind::ToMany {
                    mapping: CollectionMapping::Inverse { mapped_by },
                    ..
                } = property.kind
                {
                    let back = target_type.property_named(mapped_by);
                    let valid = matches!(
                        back.map(|p| p.kind),
                        Some(PropertyKind::ToOne { target }) if target == owner.name
                    );
                    if !valid {
                        return Err(Error::InvalidMetadata(format!(
                            "{name}.{}: '{target}.{mapped_by}' is not a to-one association to {name}",
                            property.name
                        )));
                    }
                }
            }
        }
        Ok(Arc::new(self))
    }

    /// Registered entity names in registration order.
    pub fn entity_names(&self) -> Vec<&'static str> {
        self.order.clone()
    }
}

impl MetadataModel for MetadataRegistry {
    fn entity_type(&self, name: &str) -> Option<Arc<EntityType>> {
        self.types.get(name).cloned()
    }

    fn entity_types(&self) -> Vec<Arc<EntityType>> {
        self.order
            .iter()
            .filter_map(|name| self.types.get(name).cloned())
            .collect()
    }
}
