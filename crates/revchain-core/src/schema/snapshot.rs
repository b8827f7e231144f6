//! Introspection capability queried before guarded operations.

use super::table::{ForeignKeyDef, TableDef};
use std::collections::BTreeMap;

/// Read-only view of a live schema.
///
/// Every guarded operation consults this before acting, so re-applying a
/// partially applied revision skips the work that already landed.
pub trait SchemaSnapshot {
    /// Names of all tables.
    fn table_names(&self) -> Vec<String>;

    /// Definition of a table.
    fn table(&self, name: &str) -> Option<TableDef>;

    /// Names of all enumerated types.
    fn enum_names(&self) -> Vec<String>;

    /// Values of an enumerated type, in declaration order.
    fn enum_values(&self, name: &str) -> Option<Vec<String>>;

    /// All foreign key constraints.
    fn foreign_keys(&self) -> Vec<ForeignKeyDef>;

    /// Check whether a table exists.
    fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Check whether a column exists.
    fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.has_column(column))
            .unwrap_or(false)
    }

    /// Check whether an enumerated type exists.
    fn has_enum(&self, name: &str) -> bool {
        self.enum_values(name).is_some()
    }

    /// Look up a foreign key by name.
    fn foreign_key(&self, name: &str) -> Option<ForeignKeyDef> {
        self.foreign_keys().into_iter().find(|fk| fk.name == name)
    }

    /// Foreign keys whose referenced table is `table`.
    fn references_to(&self, table: &str) -> Vec<ForeignKeyDef> {
        self.foreign_keys()
            .into_iter()
            .filter(|fk| fk.ref_table == table)
            .collect()
    }

    /// Structural shape of the whole schema, without row data.
    fn shape(&self) -> SchemaShape {
        SchemaShape {
            tables: self
                .table_names()
                .into_iter()
                .filter_map(|name| self.table(&name).map(|t| (name, t)))
                .collect(),
            enums: self
                .enum_names()
                .into_iter()
                .filter_map(|name| self.enum_values(&name).map(|v| (name, v)))
                .collect(),
            foreign_keys: self
                .foreign_keys()
                .into_iter()
                .map(|fk| (fk.name.clone(), fk))
                .collect(),
        }
    }
}

/// Tables, columns, enumerated types and constraints of a schema.
///
/// Two schemas with equal shapes are considered equivalent regardless of
/// their row contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaShape {
    /// Tables by name.
    pub tables: BTreeMap<String, TableDef>,
    /// Enumerated types by name.
    pub enums: BTreeMap<String, Vec<String>>,
    /// Foreign keys by constraint name.
    pub foreign_keys: BTreeMap<String, ForeignKeyDef>,
}

impl SchemaShape {
    /// Names of tables whose name starts with `prefix`.
    pub fn tables_with_prefix(&self, prefix: &str) -> Vec<&str> {
        self.tables
            .keys()
            .filter(|name| name.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }
}
