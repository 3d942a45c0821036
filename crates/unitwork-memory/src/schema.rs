//! Table definitions derived from entity metadata.

use std::collections::BTreeMap;

use unitwork_core::{IdGeneration, MetadataModel, PropertyKind};

/// A foreign key column and the table/column it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: &'static str,
    pub referenced_column: &'static str,
}

/// Columns and constraints of one entity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub id_column: &'static str,
    pub generated_id: bool,
    pub version_column: Option<&'static str>,
    pub not_null: Vec<&'static str>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// A link table: its primary key is the (owner, element) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSchema {
    pub name: &'static str,
    pub owner: ForeignKey,
    pub element: ForeignKey,
}

/// All tables of a database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    tables: BTreeMap<&'static str, TableSchema>,
    links: BTreeMap<&'static str, LinkSchema>,
}

impl Schema {
    /// Derive tables from every registered entity type.
    ///
    /// Non-nullable columns become `NOT NULL`, to-one associations become
    /// foreign keys and link-table collections become link tables.
    /// Associations to unregistered types are skipped.
    pub fn from_metadata(metadata: &dyn MetadataModel) -> Self {
        let mut schema = Self::default();
        for entity_type in metadata.entity_types() {
            let mut table = TableSchema {
                name: entity_type.table,
                id_column: entity_type.id_column,
                generated_id: entity_type.id_generation == IdGeneration::Generated,
                version_column: entity_type.version_column,
                not_null: vec![entity_type.id_column],
                foreign_keys: Vec::new(),
            };
            table.not_null.extend(entity_type.version_column);

            for property in entity_type.properties() {
                if property.has_column() && !property.nullable {
                    table.not_null.push(property.column);
                }
                let Some(target) = property.target().and_then(|t| metadata.entity_type(t)) else {
                    continue;
                };
                match property.kind {
                    PropertyKind::ToOne { .. } => table.foreign_keys.push(ForeignKey {
                        column: property.column,
                        references: target.table,
                        referenced_column: target.id_column,
                    }),
                    PropertyKind::ToMany { .. } => {
                        if let Some(link) = property.link_table() {
                            schema.links.insert(
                                link.table,
                                LinkSchema {
                                    name: link.table,
                                    owner: ForeignKey {
                                        column: link.owner_column,
                                        references: entity_type.table,
                                        referenced_column: entity_type.id_column,
                                    },
                                    element: ForeignKey {
                                        column: link.element_column,
                                        references: target.table,
                                        referenced_column: target.id_column,
                                    },
                                },
                            );
                        }
                    }
                    _ => {}
                }
            }
            schema.tables.insert(table.name, table);
        }
        schema
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn link(&self, name: &str) -> Option<&LinkSchema> {
        self.links.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkSchema> {
        self.links.values()
    }
}
