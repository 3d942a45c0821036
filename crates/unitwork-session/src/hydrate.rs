//! Conversion between entity state and column values.
//!
//! Dehydration turns property values into the column/value pairs written
//! through the SQL executor; hydration turns a row back into property
//! values. Embedded values travel as one JSON column. To-one associations
//! travel as the target's identifier and come back as a loaded reference
//! when the target is already managed, otherwise as an unloaded key.

use std::collections::BTreeMap;

use unitwork_core::{
    ColumnValues, EntityCollection, EntityKey, EntityRef, EntityType, Error, IdGeneration,
    PropertyInfo, PropertyKind, PropertyValue, Reference, Result, Row, Value,
};

use crate::identity_map::IdentityMap;

/// Column value of one property; `None` for collections.
pub fn column_value(
    entity_type: &'static str,
    property: &PropertyInfo,
    value: &PropertyValue,
) -> Result<Option<Value>> {
    let column = match value {
        PropertyValue::Scalar(v) => v.clone(),
        PropertyValue::Embedded(map) => Value::Json(serde_json::to_value(map)?),
        PropertyValue::Reference(Reference::Null) => Value::Null,
        PropertyValue::Reference(Reference::Unloaded(key)) => key.id().clone(),
        PropertyValue::Reference(Reference::Loaded(target)) => {
            let id = target.id();
            if id.is_null() {
                return Err(Error::TransientPropertyViolation {
                    entity_type,
                    property: property.name,
                    target_type: target.entity_type(),
                });
            }
            id
        }
        PropertyValue::Collection(_) => return Ok(None),
    };
    Ok(Some(column))
}

/// Columns written by the insert of `entity`.
///
/// `deferred` properties are written as NULL. The identifier is included
/// for assigned-id types, the version for versioned types.
pub fn insert_values(entity: &EntityRef, deferred: &[usize]) -> Result<ColumnValues> {
    let (descriptor, id, version, values) = {
        let guard = entity.read();
        (
            guard.descriptor().clone(),
            guard.id().clone(),
            guard.version().clone(),
            guard.values().to_vec(),
        )
    };

    let mut columns = ColumnValues::new();
    if descriptor.id_generation == IdGeneration::Assigned {
        columns.push((descriptor.id_column, id));
    }
    if let Some(version_column) = descriptor.version_column {
        columns.push((version_column, version));
    }
    for (index, property) in descriptor.properties().iter().enumerate() {
        if !property.has_column() || !property.insertable {
            continue;
        }
        if deferred.contains(&index) {
            columns.push((property.column, Value::Null));
            continue;
        }
        let Some(value) = values.get(index) else {
            continue;
        };
        if let Some(column) = column_value(descriptor.name, property, value)? {
            columns.push((property.column, column));
        }
    }
    Ok(columns)
}

/// Current values of the updatable columns among `properties`.
pub fn update_values(
    entity: &EntityRef,
    properties: impl IntoIterator<Item = usize>,
) -> Result<ColumnValues> {
    let (descriptor, values) = {
        let guard = entity.read();
        (guard.descriptor().clone(), guard.values().to_vec())
    };
    let mut columns = ColumnValues::new();
    for index in properties {
        let (Some(property), Some(value)) = (descriptor.property_at(index), values.get(index)) else {
            continue;
        };
        if !property.has_column() || !property.updatable {
            continue;
        }
        if let Some(column) = column_value(descriptor.name, property, value)? {
            columns.push((property.column, column));
        }
    }
    Ok(columns)
}

/// NULL for each column among `properties`.
pub fn null_values(descriptor: &EntityType, properties: &[usize]) -> ColumnValues {
    properties
        .iter()
        .filter_map(|&i| descriptor.property_at(i))
        .filter(|p| p.has_column())
        .map(|p| (p.column, Value::Null))
        .collect()
}

/// A row converted to entity state.
#[derive(Debug, Clone)]
pub struct HydratedState {
    pub id: Value,
    pub version: Value,
    pub values: Vec<PropertyValue>,
}

/// Convert a row of `descriptor`'s table to entity state.
///
/// Collections come back uninitialized.
pub fn hydrate(descriptor: &EntityType, row: &Row, identity_map: &IdentityMap) -> Result<HydratedState> {
    let column = |name: &str| row.get(name).cloned().unwrap_or(Value::Null);

    let mut values = Vec::with_capacity(descriptor.properties().len());
    for property in descriptor.properties() {
        let value = match property.kind {
            PropertyKind::Basic => PropertyValue::Scalar(column(property.column)),
            PropertyKind::Embedded => PropertyValue::Embedded(embedded_from(
                descriptor.name,
                property.name,
                &column(property.column),
            )?),
            PropertyKind::ToOne { target } => {
                let fk = column(property.column);
                if fk.is_null() {
                    PropertyValue::Reference(Reference::Null)
                } else {
                    let key = EntityKey::new(target, fk);
                    PropertyValue::Reference(match identity_map.get(&key) {
                        Some(instance) => Reference::Loaded(instance.clone()),
                        None => Reference::Unloaded(key),
                    })
                }
            }
            PropertyKind::ToMany { .. } => {
                PropertyValue::Collection(EntityCollection::uninitialized())
            }
        };
        values.push(value);
    }

    Ok(HydratedState {
        id: column(descriptor.id_column),
        version: descriptor
            .version_column
            .map_or(Value::Null, |v| column(v)),
        values,
    })
}

fn embedded_from(
    entity_type: &str,
    property: &str,
    value: &Value,
) -> Result<BTreeMap<String, Value>> {
    match value {
        Value::Null => Ok(BTreeMap::new()),
        Value::Json(json) => Ok(serde_json::from_value(json.clone())?),
        other => Err(Error::Serde(format!(
            "{entity_type}.{property}: expected a JSON object, found {}",
            other.type_name()
        ))),
    }
}

/// Overwrite `entity` with hydrated state.
pub fn apply(entity: &EntityRef, state: HydratedState) -> Result<()> {
    let mut guard = entity.write();
    guard.set_id(state.id);
    guard.set_version(state.version);
    for (index, value) in state.values.into_iter().enumerate() {
        guard.set_value_at(index, value)?;
    }
    Ok(())
}

/// Disassemble `entity` into a row for the second-level cache.
pub fn to_row(entity: &EntityRef) -> Result<Row> {
    let (descriptor, id, version, values) = {
        let guard = entity.read();
        (
            guard.descriptor().clone(),
            guard.id().clone(),
            guard.version().clone(),
            guard.values().to_vec(),
        )
    };
    let mut row = Row::new();
    row.set(descriptor.id_column, id);
    if let Some(version_column) = descriptor.version_column {
        row.set(version_column, version);
    }
    for (property, value) in descriptor.properties().iter().zip(&values) {
        if let Some(column) = column_value(descriptor.name, property, value)? {
            row.set(property.column, column);
        }
    }
    Ok(row)
}
