//! Dynamic entity records.
//!
//! An [`Entity`] is a row-shaped record whose property values are indexed by
//! the metadata property order. Application code shares instances through
//! [`EntityRef`], a cheaply cloneable handle with object identity: the
//! persistence context tracks handles, and two handles are the same object
//! exactly when their [`InstanceId`]s match.
//!
//! Associations are explicit sum types. A to-one property holds a
//! [`Reference`] that is either absent, an unloaded key, or a loaded
//! instance; loading is an explicit call on the persistence context. A
//! to-many property holds an [`EntityCollection`] whose mutators set a dirty
//! flag that flush consults instead of diffing every collection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::key::{EntityKey, InstanceId};
use crate::metadata::{EntityType, PropertyKind};
use crate::value::Value;

/// A to-one association value.
#[derive(Debug, Clone, Default)]
pub enum Reference {
    /// No associated row.
    #[default]
    Null,
    /// Associated row known by key, not loaded into memory.
    Unloaded(EntityKey),
    /// Associated instance loaded in memory.
    Loaded(EntityRef),
}

impl Reference {
    pub const fn is_null(&self) -> bool {
        matches!(self, Reference::Null)
    }

    pub const fn is_loaded(&self) -> bool {
        matches!(self, Reference::Loaded(_))
    }

    /// The loaded instance, if any.
    pub fn instance(&self) -> Option<&EntityRef> {
        match self {
            Reference::Loaded(r) => Some(r),
            _ => None,
        }
    }

    /// Key of the referenced row, when it has one.
    pub fn key(&self) -> Option<EntityKey> {
        match self {
            Reference::Null => None,
            Reference::Unloaded(key) => Some(key.clone()),
            Reference::Loaded(r) => r.key(),
        }
    }
}

impl From<&EntityRef> for Reference {
    fn from(r: &EntityRef) -> Self {
        Reference::Loaded(r.clone())
    }
}

impl From<Option<&EntityRef>> for Reference {
    fn from(r: Option<&EntityRef>) -> Self {
        r.map_or(Reference::Null, Reference::from)
    }
}

/// Collection wrapper for a to-many association.
///
/// Mutators mark the collection dirty. Collections of rows read from the
/// database start uninitialized until the persistence context loads them.
#[derive(Debug, Clone)]
pub struct EntityCollection {
    elements: Vec<EntityRef>,
    dirty: bool,
    initialized: bool,
}

impl Default for EntityCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollection {
    /// Empty, initialized collection.
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            dirty: false,
            initialized: true,
        }
    }

    /// Collection whose elements have not been read yet.
    pub fn uninitialized() -> Self {
        Self {
            elements: Vec::new(),
            dirty: false,
            initialized: false,
        }
    }

    pub fn push(&mut self, element: &EntityRef) {
        self.elements.push(element.clone());
        self.dirty = true;
    }

    /// Remove an element by identity. Returns whether it was present.
    pub fn remove(&mut self, element: &EntityRef) -> bool {
        let before = self.elements.len();
        self.elements.retain(|e| !e.ptr_eq(element));
        let removed = self.elements.len() != before;
        self.dirty |= removed;
        removed
    }

    pub fn clear(&mut self) {
        if !self.elements.is_empty() {
            self.dirty = true;
        }
        self.elements.clear();
    }

    /// Replace the whole content.
    pub fn replace(&mut self, elements: Vec<EntityRef>) {
        self.elements = elements;
        self.initialized = true;
        self.dirty = true;
    }

    pub fn contains(&self, element: &EntityRef) -> bool {
        self.elements.iter().any(|e| e.ptr_eq(element))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.elements.iter()
    }

    pub fn elements(&self) -> &[EntityRef] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Install loaded elements without marking the collection dirty.
    pub fn initialize(&mut self, elements: Vec<EntityRef>) {
        self.elements = elements;
        self.initialized = true;
        self.dirty = false;
    }

    /// Reset the dirty flag once the collection is synchronized.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// Value of one property of an entity.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Scalar(Value),
    Embedded(BTreeMap<String, Value>),
    Reference(Reference),
    Collection(EntityCollection),
}

impl PropertyValue {
    /// Default value for a property of the given kind.
    pub fn default_for(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Basic => PropertyValue::Scalar(Value::Null),
            PropertyKind::Embedded => PropertyValue::Embedded(BTreeMap::new()),
            PropertyKind::ToOne { .. } => PropertyValue::Reference(Reference::Null),
            PropertyKind::ToMany { .. } => PropertyValue::Collection(EntityCollection::new()),
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            PropertyValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&EntityCollection> {
        match self {
            PropertyValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            PropertyValue::Embedded(m) => Some(m),
            _ => None,
        }
    }

    const fn kind_name(&self) -> &'static str {
        match self {
            PropertyValue::Scalar(_) => "scalar",
            PropertyValue::Embedded(_) => "embedded",
            PropertyValue::Reference(_) => "reference",
            PropertyValue::Collection(_) => "collection",
        }
    }

    fn fits(&self, kind: PropertyKind) -> bool {
        matches!(
            (self, kind),
            (PropertyValue::Scalar(_), PropertyKind::Basic)
                | (PropertyValue::Embedded(_), PropertyKind::Embedded)
                | (PropertyValue::Reference(_), PropertyKind::ToOne { .. })
                | (PropertyValue::Collection(_), PropertyKind::ToMany { .. })
        )
    }
}

/// A dynamic entity record.
#[derive(Debug, Clone)]
pub struct Entity {
    descriptor: Arc<EntityType>,
    id: Value,
    version: Value,
    values: Vec<PropertyValue>,
}

impl Entity {
    /// New record with every property at its default.
    pub fn new(descriptor: Arc<EntityType>) -> Self {
        let values = descriptor
            .properties()
            .iter()
            .map(|p| PropertyValue::default_for(p.kind))
            .collect();
        Self {
            descriptor,
            id: Value::Null,
            version: Value::Null,
            values,
        }
    }

    pub fn descriptor(&self) -> &Arc<EntityType> {
        &self.descriptor
    }

    pub fn entity_type(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<Value>) {
        self.id = id.into();
    }

    pub fn version(&self) -> &Value {
        &self.version
    }

    pub fn set_version(&mut self, version: impl Into<Value>) {
        self.version = version.into();
    }

    /// Key of this record, once it has an identifier.
    pub fn key(&self) -> Option<EntityKey> {
        (!self.id.is_null()).then(|| EntityKey::new(self.descriptor.name, self.id.clone()))
    }

    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }

    pub fn value_at(&self, index: usize) -> Option<&PropertyValue> {
        self.values.get(index)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.descriptor
            .property_index(name)
            .ok_or_else(|| Error::UnknownProperty {
                entity_type: self.descriptor.name,
                property: name.to_string(),
            })
    }

    /// Replace the value at `index`, checking it matches the property kind.
    pub fn set_value_at(&mut self, index: usize, value: PropertyValue) -> Result<()> {
        let Some(property) = self.descriptor.property_at(index) else {
            return Err(Error::UnknownProperty {
                entity_type: self.descriptor.name,
                property: format!("#{index}"),
            });
        };
        if !value.fits(property.kind) {
            return Err(Error::InvalidMetadata(format!(
                "{}.{}: cannot store a {} value",
                self.descriptor.name,
                property.name,
                value.kind_name()
            )));
        }
        self.values[index] = value;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.descriptor
            .property_index(name)
            .and_then(|i| self.values.get(i))
    }

    /// Scalar property value.
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(PropertyValue::as_scalar)
    }

    pub fn reference(&self, name: &str) -> Option<&Reference> {
        self.get(name).and_then(PropertyValue::as_reference)
    }

    pub fn collection(&self, name: &str) -> Option<&EntityCollection> {
        self.get(name).and_then(PropertyValue::as_collection)
    }

    pub fn embedded(&self, name: &str) -> Option<&BTreeMap<String, Value>> {
        self.get(name).and_then(PropertyValue::as_embedded)
    }

    /// Set a scalar property.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.index_of(name)?;
        self.set_value_at(index, PropertyValue::Scalar(value.into()))
    }

    /// Point a to-one association at `target`, or clear it with `None`.
    pub fn set_reference(&mut self, name: &str, target: Option<&EntityRef>) -> Result<()> {
        let index = self.index_of(name)?;
        self.set_value_at(index, PropertyValue::Reference(Reference::from(target)))
    }

    pub fn set_embedded(&mut self, name: &str, value: BTreeMap<String, Value>) -> Result<()> {
        let index = self.index_of(name)?;
        self.set_value_at(index, PropertyValue::Embedded(value))
    }

    /// Mutable access to a collection property.
    pub fn collection_mut(&mut self, name: &str) -> Result<&mut EntityCollection> {
        let index = self.index_of(name)?;
        match &mut self.values[index] {
            PropertyValue::Collection(c) => Ok(c),
            other => Err(Error::InvalidMetadata(format!(
                "{}.{name}: {} property is not a collection",
                self.descriptor.name,
                other.kind_name()
            ))),
        }
    }

    /// Mutable access to a collection property by index.
    pub fn collection_at_mut(&mut self, index: usize) -> Option<&mut EntityCollection> {
        match self.values.get_mut(index) {
            Some(PropertyValue::Collection(c)) => Some(c),
            _ => None,
        }
    }
}

// Dropping a long chain of loaded associations would otherwise recurse
// once per link. Children are detached onto an explicit stack instead, and
// an entity is only unwrapped when the handle being released is its last.
impl Drop for Entity {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        detach_associations(&mut self.values, &mut pending);
        while let Some(handle) = pending.pop() {
            if let Ok(lock) = Arc::try_unwrap(handle.inner) {
                let mut entity = lock.into_inner().unwrap_or_else(PoisonError::into_inner);
                detach_associations(&mut entity.values, &mut pending);
            }
        }
    }
}

fn detach_associations(values: &mut [PropertyValue], pending: &mut Vec<EntityRef>) {
    for value in values {
        match value {
            PropertyValue::Reference(reference) => {
                if let Reference::Loaded(target) = std::mem::take(reference) {
                    pending.push(target);
                }
            }
            PropertyValue::Collection(collection) => {
                pending.append(&mut collection.elements);
            }
            PropertyValue::Scalar(_) | PropertyValue::Embedded(_) => {}
        }
    }
}

/// Read guard over an entity.
pub type EntityReadGuard<'a> = RwLockReadGuard<'a, Entity>;
/// Write guard over an entity.
pub type EntityWriteGuard<'a> = RwLockWriteGuard<'a, Entity>;

/// Shared handle to an entity instance.
///
/// Cloning the handle does not copy the entity; identity is the
/// [`InstanceId`] assigned when the handle was created.
///
/// Handles are reference counted. Instances that reach each other through
/// loaded associations (a parent and its children, mutual references, a
/// self reference) keep each other alive after every outside handle is
/// gone, including after the persistence context is closed. Clear those
/// associations, for example with [`Entity::set_reference`] to `None`, to
/// release such a graph.
#[derive(Clone)]
pub struct EntityRef {
    instance: InstanceId,
    entity_type: &'static str,
    inner: Arc<RwLock<Entity>>,
}

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self {
            instance: InstanceId::next(),
            entity_type: entity.entity_type(),
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Same object (not merely equal state).
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        self.instance == other.instance
    }

    /// Lock for reading.
    ///
    /// A poisoned lock still yields the data: entity state is plain values
    /// and a panic elsewhere cannot leave it half-written.
    pub fn read(&self) -> EntityReadGuard<'_> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for writing.
    pub fn write(&self) -> EntityWriteGuard<'_> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current key, once an identifier is assigned.
    pub fn key(&self) -> Option<EntityKey> {
        self.read().key()
    }

    pub fn id(&self) -> Value {
        self.read().id().clone()
    }

    /// Clone of the current property values.
    pub fn values(&self) -> Vec<PropertyValue> {
        self.read().values().to_vec()
    }
}

impl fmt::Debug for EntityRef {
    // Never locks: a reference cycle or a held write guard must not
    // deadlock formatting.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({}{})", self.entity_type, self.instance)
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}
