//! Embedded relational backend persisted in sled.
//!
//! Keeps a working image of every table, enumerated type and foreign key in
//! memory and writes changed objects back to a sled tree. With transactional
//! DDL enabled (the default) writes are held until `commit`; otherwise every
//! operation is written through as soon as it completes, which is the
//! behaviour the guarded re-apply path is designed for.

use super::database::{Database, DatabaseError};
use super::expr::Expr;
use super::snapshot::SchemaSnapshot;
use super::table::{ColumnDef, ForeignKeyDef, TableDef};
use super::types::{row_key, ColumnType, Row, Value};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::collections::{BTreeMap, HashSet};

/// Tree holding the schema objects and their rows.
const OBJECT_TREE: &str = "embedded:objects";

const TABLE_PREFIX: &str = "table:";
const ENUM_PREFIX: &str = "enum:";
const FK_PREFIX: &str = "fk:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TableData {
    def: TableDef,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Image {
    tables: BTreeMap<String, TableData>,
    enums: BTreeMap<String, Vec<String>>,
    foreign_keys: BTreeMap<String, ForeignKeyDef>,
}

/// A sled-backed database implementing [`Database`].
pub struct EmbeddedDatabase {
    tree: Tree,
    image: Image,
    persisted: Image,
    in_transaction: bool,
    transactional_ddl: bool,
}

fn storage(e: sled::Error) -> DatabaseError {
    DatabaseError::Storage(Error::Storage(e))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DatabaseError> {
    serde_json::to_vec(value).map_err(|e| DatabaseError::Storage(Error::Serialization(e.to_string())))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, DatabaseError> {
    serde_json::from_slice(bytes)
        .map_err(|e| DatabaseError::Storage(Error::Deserialization(e.to_string())))
}

impl EmbeddedDatabase {
    /// Open the embedded database stored in `db`.
    pub fn open(db: &Db) -> Result<Self, DatabaseError> {
        let tree = db.open_tree(OBJECT_TREE).map_err(storage)?;
        let mut image = Image::default();

        for entry in tree.iter() {
            let (key, value) = entry.map_err(storage)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if let Some(name) = key.strip_prefix(TABLE_PREFIX) {
                image.tables.insert(name.to_string(), decode(&value)?);
            } else if let Some(name) = key.strip_prefix(ENUM_PREFIX) {
                image.enums.insert(name.to_string(), decode(&value)?);
            } else if let Some(name) = key.strip_prefix(FK_PREFIX) {
                image.foreign_keys.insert(name.to_string(), decode(&value)?);
            } else {
                return Err(DatabaseError::Storage(Error::InvalidData(format!(
                    "unexpected key '{}' in {}",
                    key, OBJECT_TREE
                ))));
            }
        }

        Ok(Self {
            tree,
            persisted: image.clone(),
            image,
            in_transaction: false,
            transactional_ddl: true,
        })
    }

    /// Open a throwaway database that is removed on drop.
    pub fn temporary() -> Result<(Self, Db), DatabaseError> {
        let db = sled::Config::new().temporary(true).open().map_err(storage)?;
        let database = Self::open(&db)?;
        Ok((database, db))
    }

    /// Enable or disable transactional DDL.
    pub fn with_transactional_ddl(mut self, enabled: bool) -> Self {
        self.transactional_ddl = enabled;
        self
    }

    /// All rows of a table in primary-key order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, DatabaseError> {
        Ok(self.table_data(table)?.rows.values().cloned().collect())
    }

    fn table_data(&self, name: &str) -> Result<&TableData, DatabaseError> {
        self.image
            .tables
            .get(name)
            .ok_or_else(|| DatabaseError::TableNotFound(name.to_string()))
    }

    fn table_data_mut(&mut self, name: &str) -> Result<&mut TableData, DatabaseError> {
        self.image
            .tables
            .get_mut(name)
            .ok_or_else(|| DatabaseError::TableNotFound(name.to_string()))
    }

    /// Write the image back unless a transaction is holding it.
    fn written(&mut self) -> Result<(), DatabaseError> {
        if self.in_transaction {
            return Ok(());
        }
        self.flush_image()
    }

    fn flush_image(&mut self) -> Result<(), DatabaseError> {
        let mut batch = Batch::default();

        for (name, data) in &self.image.tables {
            if self.persisted.tables.get(name) != Some(data) {
                batch.insert(format!("{}{}", TABLE_PREFIX, name).into_bytes(), encode(data)?);
            }
        }
        for name in self.persisted.tables.keys() {
            if !self.image.tables.contains_key(name) {
                batch.remove(format!("{}{}", TABLE_PREFIX, name).into_bytes());
            }
        }

        for (name, values) in &self.image.enums {
            if self.persisted.enums.get(name) != Some(values) {
                batch.insert(format!("{}{}", ENUM_PREFIX, name).into_bytes(), encode(values)?);
            }
        }
        for name in self.persisted.enums.keys() {
            if !self.image.enums.contains_key(name) {
                batch.remove(format!("{}{}", ENUM_PREFIX, name).into_bytes());
            }
        }

        for (name, fk) in &self.image.foreign_keys {
            if self.persisted.foreign_keys.get(name) != Some(fk) {
                batch.insert(format!("{}{}", FK_PREFIX, name).into_bytes(), encode(fk)?);
            }
        }
        for name in self.persisted.foreign_keys.keys() {
            if !self.image.foreign_keys.contains_key(name) {
                batch.remove(format!("{}{}", FK_PREFIX, name).into_bytes());
            }
        }

        self.tree.apply_batch(batch).map_err(storage)?;
        self.tree.flush().map_err(storage)?;
        self.persisted = self.image.clone();
        Ok(())
    }

    fn check_enum_exists(&self, ty: &ColumnType) -> Result<(), DatabaseError> {
        match ty.enum_name() {
            Some(name) if !self.image.enums.contains_key(name) => {
                Err(DatabaseError::EnumNotFound(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn check_value(
        &self,
        table: &str,
        column: &ColumnDef,
        value: &Value,
    ) -> Result<(), DatabaseError> {
        if value.is_null() {
            if column.nullable {
                return Ok(());
            }
            return Err(DatabaseError::NotNullViolation {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }

        let enum_values = column
            .ty
            .enum_name()
            .and_then(|name| self.image.enums.get(name))
            .map(Vec::as_slice);
        if column.ty.accepts(value, enum_values) {
            Ok(())
        } else {
            Err(DatabaseError::InvalidValue {
                table: table.to_string(),
                column: column.name.clone(),
                ty: column.ty.clone(),
                value: value.to_string(),
            })
        }
    }

    /// Fill defaults, reject unknown columns and type-check a row.
    fn normalize_row(&self, def: &TableDef, mut row: Row) -> Result<(String, Row), DatabaseError> {
        if let Some(unknown) = row.keys().find(|name| !def.has_column(name)) {
            return Err(DatabaseError::ColumnNotFound {
                table: def.name.clone(),
                column: unknown.clone(),
            });
        }

        for column in &def.columns {
            if !row.contains_key(&column.name) {
                let value = column.default.clone().unwrap_or(Value::Null);
                row.insert(column.name.clone(), value);
            }
            if let Some(value) = row.get(&column.name) {
                self.check_value(&def.name, column, value)?;
            }
        }

        let key = match row.get(&def.primary_key) {
            Some(value) if !value.is_null() => row_key(value),
            _ => return Err(DatabaseError::MissingPrimaryKey(def.name.clone())),
        };
        Ok((key, row))
    }

    fn referenced_values(&self, table: &str, column: &str) -> Result<HashSet<String>, DatabaseError> {
        let data = self.table_data(table)?;
        Ok(data
            .rows
            .values()
            .filter_map(|row| row.get(column))
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect())
    }

    fn check_outbound_references(&self, table: &str, rows: &[Row]) -> Result<(), DatabaseError> {
        let outbound: Vec<&ForeignKeyDef> = self
            .image
            .foreign_keys
            .values()
            .filter(|fk| fk.table == table)
            .collect();

        for fk in outbound {
            let targets = if fk.ref_table == table {
                // Self references may point at rows in the same batch.
                let mut targets = self.referenced_values(table, &fk.ref_column)?;
                targets.extend(
                    rows.iter()
                        .filter_map(|r| r.get(&fk.ref_column))
                        .map(|v| v.to_string()),
                );
                targets
            } else {
                self.referenced_values(&fk.ref_table, &fk.ref_column)?
            };

            let orphans = rows
                .iter()
                .filter_map(|r| r.get(&fk.column))
                .filter(|v| !v.is_null() && !targets.contains(&v.to_string()))
                .count() as u64;
            if orphans > 0 {
                return Err(DatabaseError::ForeignKeyViolation {
                    constraint: fk.name.clone(),
                    orphans,
                });
            }
        }
        Ok(())
    }
}

impl SchemaSnapshot for EmbeddedDatabase {
    fn table_names(&self) -> Vec<String> {
        self.image.tables.keys().cloned().collect()
    }

    fn table(&self, name: &str) -> Option<TableDef> {
        self.image.tables.get(name).map(|t| t.def.clone())
    }

    fn enum_names(&self) -> Vec<String> {
        self.image.enums.keys().cloned().collect()
    }

    fn enum_values(&self, name: &str) -> Option<Vec<String>> {
        self.image.enums.get(name).cloned()
    }

    fn foreign_keys(&self) -> Vec<ForeignKeyDef> {
        self.image.foreign_keys.values().cloned().collect()
    }
}

impl Database for EmbeddedDatabase {
    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }

    fn begin(&mut self) -> Result<(), DatabaseError> {
        if !self.transactional_ddl {
            return Err(DatabaseError::Unsupported(
                "transactional DDL is disabled".to_string(),
            ));
        }
        if self.in_transaction {
            return Err(DatabaseError::Transaction(
                "transaction already open".to_string(),
            ));
        }
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Err(DatabaseError::Transaction("no open transaction".to_string()));
        }
        self.in_transaction = false;
        self.flush_image()
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Err(DatabaseError::Transaction("no open transaction".to_string()));
        }
        self.in_transaction = false;
        self.image = self.persisted.clone();
        Ok(())
    }

    fn create_table(&mut self, def: &TableDef) -> Result<(), DatabaseError> {
        if self.image.tables.contains_key(&def.name) {
            return Err(DatabaseError::TableExists(def.name.clone()));
        }
        if !def.has_column(&def.primary_key) {
            return Err(DatabaseError::ColumnNotFound {
                table: def.name.clone(),
                column: def.primary_key.clone(),
            });
        }
        for column in &def.columns {
            self.check_enum_exists(&column.ty)?;
        }

        self.image.tables.insert(
            def.name.clone(),
            TableData {
                def: def.clone(),
                rows: BTreeMap::new(),
            },
        );
        self.written()
    }

    fn drop_table(&mut self, name: &str) -> Result<(), DatabaseError> {
        self.table_data(name)?;

        let inbound: Vec<String> = self
            .image
            .foreign_keys
            .values()
            .filter(|fk| fk.ref_table == name && fk.table != name)
            .map(|fk| fk.name.clone())
            .collect();
        if !inbound.is_empty() {
            return Err(DatabaseError::TableReferenced {
                table: name.to_string(),
                constraints: inbound,
            });
        }

        self.image.foreign_keys.retain(|_, fk| fk.table != name);
        self.image.tables.remove(name);
        self.written()
    }

    fn rename_table(&mut self, from: &str, to: &str) -> Result<(), DatabaseError> {
        if self.image.tables.contains_key(to) {
            return Err(DatabaseError::TableExists(to.to_string()));
        }
        let mut data = self
            .image
            .tables
            .remove(from)
            .ok_or_else(|| DatabaseError::TableNotFound(from.to_string()))?;
        data.def.name = to.to_string();
        self.image.tables.insert(to.to_string(), data);

        for fk in self.image.foreign_keys.values_mut() {
            if fk.table == from {
                fk.table = to.to_string();
            }
            if fk.ref_table == from {
                fk.ref_table = to.to_string();
            }
        }
        self.written()
    }

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), DatabaseError> {
        self.check_enum_exists(&column.ty)?;
        let data = self.table_data(table)?;
        if data.def.has_column(&column.name) {
            return Err(DatabaseError::ColumnExists {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }

        let fill = column.default.clone().unwrap_or(Value::Null);
        if !data.rows.is_empty() {
            self.check_value(table, column, &fill)?;
        }

        let data = self.table_data_mut(table)?;
        data.def.columns.push(column.clone());
        for row in data.rows.values_mut() {
            row.insert(column.name.clone(), fill.clone());
        }
        self.written()
    }

    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), DatabaseError> {
        let data = self.table_data(table)?;
        if !data.def.has_column(column) {
            return Err(DatabaseError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        if data.def.primary_key == column {
            return Err(DatabaseError::Unsupported(format!(
                "cannot drop primary key column '{}.{}'",
                table, column
            )));
        }
        let inbound: Vec<String> = self
            .image
            .foreign_keys
            .values()
            .filter(|fk| fk.ref_table == table && fk.ref_column == column)
            .map(|fk| fk.name.clone())
            .collect();
        if !inbound.is_empty() {
            return Err(DatabaseError::TableReferenced {
                table: table.to_string(),
                constraints: inbound,
            });
        }

        self.image
            .foreign_keys
            .retain(|_, fk| !(fk.table == table && fk.column == column));
        let data = self.table_data_mut(table)?;
        data.def.columns.retain(|c| c.name != column);
        for row in data.rows.values_mut() {
            row.remove(column);
        }
        self.written()
    }

    fn alter_column_type(
        &mut self,
        table: &str,
        column: &str,
        ty: &ColumnType,
    ) -> Result<(), DatabaseError> {
        self.check_enum_exists(ty)?;
        let data = self.table_data(table)?;
        let mut altered = data
            .def
            .column(column)
            .cloned()
            .ok_or_else(|| DatabaseError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        altered.ty = ty.clone();

        for row in data.rows.values() {
            if let Some(value) = row.get(column) {
                self.check_value(table, &altered, value)?;
            }
        }

        let data = self.table_data_mut(table)?;
        if let Some(existing) = data.def.columns.iter_mut().find(|c| c.name == column) {
            *existing = altered;
        }
        self.written()
    }

    fn create_enum(&mut self, name: &str, values: &[String]) -> Result<(), DatabaseError> {
        if self.image.enums.contains_key(name) {
            return Err(DatabaseError::EnumExists(name.to_string()));
        }
        let mut unique: Vec<String> = Vec::with_capacity(values.len());
        for value in values {
            if !unique.contains(value) {
                unique.push(value.clone());
            }
        }
        self.image.enums.insert(name.to_string(), unique);
        self.written()
    }

    fn add_enum_values(&mut self, name: &str, values: &[String]) -> Result<usize, DatabaseError> {
        let existing = self
            .image
            .enums
            .get_mut(name)
            .ok_or_else(|| DatabaseError::EnumNotFound(name.to_string()))?;

        let mut added = 0;
        for value in values {
            if !existing.contains(value) {
                existing.push(value.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.written()?;
        }
        Ok(added)
    }

    fn rename_enum(&mut self, from: &str, to: &str) -> Result<(), DatabaseError> {
        if self.image.enums.contains_key(to) {
            return Err(DatabaseError::EnumExists(to.to_string()));
        }
        let values = self
            .image
            .enums
            .remove(from)
            .ok_or_else(|| DatabaseError::EnumNotFound(from.to_string()))?;
        self.image.enums.insert(to.to_string(), values);

        for data in self.image.tables.values_mut() {
            for column in &mut data.def.columns {
                if column.ty.enum_name() == Some(from) {
                    column.ty = ColumnType::enumeration(to);
                }
            }
        }
        self.written()
    }

    fn drop_enum(&mut self, name: &str) -> Result<(), DatabaseError> {
        if !self.image.enums.contains_key(name) {
            return Err(DatabaseError::EnumNotFound(name.to_string()));
        }
        for data in self.image.tables.values() {
            if let Some(column) = data.def.columns.iter().find(|c| c.ty.enum_name() == Some(name)) {
                return Err(DatabaseError::EnumInUse {
                    name: name.to_string(),
                    table: data.def.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
        self.image.enums.remove(name);
        self.written()
    }

    fn add_foreign_key(&mut self, fk: &ForeignKeyDef) -> Result<(), DatabaseError> {
        if self.image.foreign_keys.contains_key(&fk.name) {
            return Err(DatabaseError::ConstraintExists(fk.name.clone()));
        }
        for (table, column) in [(&fk.table, &fk.column), (&fk.ref_table, &fk.ref_column)] {
            if !self.table_data(table)?.def.has_column(column) {
                return Err(DatabaseError::ColumnNotFound {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }

        let orphans = self.orphaned_rows(fk)?;
        if orphans > 0 {
            return Err(DatabaseError::ForeignKeyViolation {
                constraint: fk.name.clone(),
                orphans,
            });
        }

        self.image.foreign_keys.insert(fk.name.clone(), fk.clone());
        self.written()
    }

    fn drop_foreign_key(&mut self, name: &str) -> Result<(), DatabaseError> {
        if self.image.foreign_keys.remove(name).is_none() {
            return Err(DatabaseError::ConstraintNotFound(name.to_string()));
        }
        self.written()
    }

    fn row_count(&self, table: &str) -> Result<u64, DatabaseError> {
        Ok(self.table_data(table)?.rows.len() as u64)
    }

    fn scan(
        &self,
        table: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Row)>, DatabaseError> {
        let data = self.table_data(table)?;
        let rows = match after {
            Some(key) => data
                .rows
                .range::<str, _>((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
            None => data
                .rows
                .iter()
                .take(limit)
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
        };
        Ok(rows)
    }

    fn upsert_rows(&mut self, table: &str, rows: Vec<Row>) -> Result<u64, DatabaseError> {
        let def = self.table_data(table)?.def.clone();
        let mut normalized = Vec::with_capacity(rows.len());
        for row in rows {
            normalized.push(self.normalize_row(&def, row)?);
        }

        let checked: Vec<Row> = normalized.iter().map(|(_, r)| r.clone()).collect();
        self.check_outbound_references(table, &checked)?;

        let count = normalized.len() as u64;
        let data = self.table_data_mut(table)?;
        for (key, row) in normalized {
            data.rows.insert(key, row);
        }
        self.written()?;
        Ok(count)
    }

    fn update_column(
        &mut self,
        table: &str,
        column: &str,
        expr: &Expr,
        only_null: bool,
    ) -> Result<u64, DatabaseError> {
        let data = self.table_data(table)?;
        let target = data
            .def
            .column(column)
            .cloned()
            .ok_or_else(|| DatabaseError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })?;

        let mut updates = Vec::new();
        for (key, row) in &data.rows {
            let current = row.get(column).cloned().unwrap_or(Value::Null);
            if only_null && !current.is_null() {
                continue;
            }
            let value = expr.evaluate(row)?;
            self.check_value(table, &target, &value)?;
            if value != current {
                updates.push((key.clone(), value));
            }
        }

        let count = updates.len() as u64;
        let data = self.table_data_mut(table)?;
        for (key, value) in updates {
            if let Some(row) = data.rows.get_mut(&key) {
                row.insert(column.to_string(), value);
            }
        }
        if count > 0 {
            self.written()?;
        }
        Ok(count)
    }

    fn orphaned_rows(&self, fk: &ForeignKeyDef) -> Result<u64, DatabaseError> {
        let targets = self.referenced_values(&fk.ref_table, &fk.ref_column)?;
        let data = self.table_data(&fk.table)?;
        Ok(data
            .rows
            .values()
            .filter_map(|row| row.get(&fk.column))
            .filter(|v| !v.is_null() && !targets.contains(&v.to_string()))
            .count() as u64)
    }

    fn execute_raw(&mut self, sql: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::Unsupported(format!(
            "embedded backend cannot execute raw SQL: {}",
            sql
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn movements() -> TableDef {
        TableDef::new("movements", "id")
            .with_column(ColumnDef::required("id", ColumnType::Integer))
            .with_column(ColumnDef::required("name", ColumnType::Text))
    }

    fn exercises() -> TableDef {
        TableDef::new("session_exercises", "id")
            .with_column(ColumnDef::required("id", ColumnType::Integer))
            .with_column(ColumnDef::new("movement_id", ColumnType::Integer))
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn fk() -> ForeignKeyDef {
        ForeignKeyDef::new(
            "session_exercises_movement_id_fkey",
            "session_exercises",
            "movement_id",
            "movements",
            "id",
        )
    }

    #[test]
    fn test_create_and_persist() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        {
            let mut database = EmbeddedDatabase::open(&db).unwrap();
            database.create_table(&movements()).unwrap();
            database
                .upsert_rows("movements", vec![row(&[("id", json!(1)), ("name", json!("Squat"))])])
                .unwrap();
        }

        let reopened = EmbeddedDatabase::open(&db).unwrap();
        assert!(reopened.has_table("movements"));
        assert_eq!(reopened.row_count("movements").unwrap(), 1);
    }

    #[test]
    fn test_rollback_discards_changes() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_table(&movements()).unwrap();

        database.begin().unwrap();
        database.drop_table("movements").unwrap();
        assert!(!database.has_table("movements"));
        database.rollback().unwrap();

        assert!(database.has_table("movements"));
    }

    #[test]
    fn test_begin_requires_transactional_ddl() {
        let (database, _db) = EmbeddedDatabase::temporary().unwrap();
        let mut database = database.with_transactional_ddl(false);
        assert!(matches!(database.begin(), Err(DatabaseError::Unsupported(_))));
    }

    #[test]
    fn test_rename_carries_inbound_foreign_keys() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_table(&movements()).unwrap();
        database.create_table(&exercises()).unwrap();
        database.add_foreign_key(&fk()).unwrap();

        database.rename_table("movements", "old_movements").unwrap();

        let carried = database.foreign_key(&fk().name).unwrap();
        assert_eq!(carried.ref_table, "old_movements");
        assert_eq!(database.references_to("old_movements").len(), 1);
    }

    #[test]
    fn test_drop_referenced_table_fails() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_table(&movements()).unwrap();
        database.create_table(&exercises()).unwrap();
        database.add_foreign_key(&fk()).unwrap();

        let err = database.drop_table("movements").unwrap_err();
        assert!(matches!(err, DatabaseError::TableReferenced { .. }));
    }

    #[test]
    fn test_foreign_key_rejects_orphans() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_table(&movements()).unwrap();
        database.create_table(&exercises()).unwrap();
        database
            .upsert_rows(
                "session_exercises",
                vec![row(&[("id", json!(1)), ("movement_id", json!(42))])],
            )
            .unwrap();

        let err = database.add_foreign_key(&fk()).unwrap_err();
        assert!(matches!(err, DatabaseError::ForeignKeyViolation { orphans: 1, .. }));
    }

    #[test]
    fn test_upsert_checks_types_and_references() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_enum("exercise_role", &["main".to_string()]).unwrap();
        database
            .create_table(
                &movements().with_column(ColumnDef::new(
                    "role",
                    ColumnType::enumeration("exercise_role"),
                )),
            )
            .unwrap();

        let err = database
            .upsert_rows(
                "movements",
                vec![row(&[("id", json!(1)), ("name", json!("Row")), ("role", json!("cooldown"))])],
            )
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidValue { .. }));

        let err = database
            .upsert_rows("movements", vec![row(&[("id", json!(1))])])
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotNullViolation { .. }));
    }

    #[test]
    fn test_scan_pages_in_key_order() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_table(&movements()).unwrap();
        let rows = (1..=5)
            .map(|i| row(&[("id", json!(i)), ("name", json!(format!("m{}", i)))]))
            .collect();
        database.upsert_rows("movements", rows).unwrap();

        let first = database.scan("movements", None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = database.scan("movements", Some(&first[1].0), 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].1["id"], json!(3));
    }

    #[test]
    fn test_enum_values_are_appended_once() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        database.create_enum("exercise_role", &["main".to_string()]).unwrap();

        let added = database
            .add_enum_values("exercise_role", &["main".to_string(), "warmup".to_string()])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            database.enum_values("exercise_role").unwrap(),
            vec!["main".to_string(), "warmup".to_string()]
        );
    }

    #[test]
    fn test_raw_sql_is_unsupported() {
        let (mut database, _db) = EmbeddedDatabase::temporary().unwrap();
        assert!(matches!(
            database.execute_raw("SELECT 1"),
            Err(DatabaseError::Unsupported(_))
        ));
    }
}
