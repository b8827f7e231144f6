//! The live database collaborator.

use super::expr::{Expr, ExprError};
use super::snapshot::SchemaSnapshot;
use super::table::{ColumnDef, ForeignKeyDef, TableDef};
use super::types::{ColumnType, Row};
use thiserror::Error;

/// Errors raised by a database backend.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Table already exists.
    #[error("table '{0}' already exists")]
    TableExists(String),

    /// Table does not exist.
    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    /// Column already exists.
    #[error("column '{table}.{column}' already exists")]
    ColumnExists {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Column does not exist.
    #[error("column '{table}.{column}' does not exist")]
    ColumnNotFound {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Enumerated type already exists.
    #[error("enum type '{0}' already exists")]
    EnumExists(String),

    /// Enumerated type does not exist.
    #[error("enum type '{0}' does not exist")]
    EnumNotFound(String),

    /// Enumerated type is still used by a column.
    #[error("enum type '{name}' is used by column '{table}.{column}'")]
    EnumInUse {
        /// Enum type name.
        name: String,
        /// Table holding the column.
        table: String,
        /// Column using the type.
        column: String,
    },

    /// Constraint already exists.
    #[error("constraint '{0}' already exists")]
    ConstraintExists(String),

    /// Constraint does not exist.
    #[error("constraint '{0}' does not exist")]
    ConstraintNotFound(String),

    /// Table cannot be dropped while other tables reference it.
    #[error("table '{table}' is referenced by constraints {constraints:?}")]
    TableReferenced {
        /// Table name.
        table: String,
        /// Inbound constraint names.
        constraints: Vec<String>,
    },

    /// Rows reference keys missing from the referenced table.
    #[error("foreign key '{constraint}' has {orphans} orphaned row(s)")]
    ForeignKeyViolation {
        /// Constraint name.
        constraint: String,
        /// Number of orphaned rows.
        orphans: u64,
    },

    /// A value does not fit its column.
    #[error("invalid value {value} for column '{table}.{column}' of type {ty}")]
    InvalidValue {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Column type.
        ty: ColumnType,
        /// The rejected value.
        value: String,
    },

    /// NULL written into a NOT NULL column.
    #[error("null value in column '{table}.{column}' violates not-null constraint")]
    NotNullViolation {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Row without its primary key.
    #[error("row for table '{0}' has no primary key value")]
    MissingPrimaryKey(String),

    /// Expression evaluation failed.
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// The backend cannot perform the request.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Transaction misuse.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] crate::error::Error),
}

/// A live relational database with DDL, DML and introspection.
///
/// Renaming a table carries inbound foreign keys along with it, as
/// PostgreSQL does; constraints that should follow a swapped table must be
/// dropped and recreated explicitly.
pub trait Database: SchemaSnapshot {
    /// Whether DDL can run inside a transaction on this backend.
    fn supports_transactional_ddl(&self) -> bool;

    /// Start a transaction.
    fn begin(&mut self) -> Result<(), DatabaseError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), DatabaseError>;

    /// Abandon the open transaction.
    fn rollback(&mut self) -> Result<(), DatabaseError>;

    /// Create a table.
    fn create_table(&mut self, def: &TableDef) -> Result<(), DatabaseError>;

    /// Drop a table. Fails while foreign keys reference it.
    fn drop_table(&mut self, name: &str) -> Result<(), DatabaseError>;

    /// Rename a table.
    fn rename_table(&mut self, from: &str, to: &str) -> Result<(), DatabaseError>;

    /// Add a column, filling existing rows with its default.
    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), DatabaseError>;

    /// Drop a column and its data.
    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), DatabaseError>;

    /// Change a column's type; existing values must fit the new type.
    fn alter_column_type(
        &mut self,
        table: &str,
        column: &str,
        ty: &ColumnType,
    ) -> Result<(), DatabaseError>;

    /// Create an enumerated type.
    fn create_enum(&mut self, name: &str, values: &[String]) -> Result<(), DatabaseError>;

    /// Append the values not already present. Returns how many were added.
    fn add_enum_values(&mut self, name: &str, values: &[String]) -> Result<usize, DatabaseError>;

    /// Rename an enumerated type.
    fn rename_enum(&mut self, from: &str, to: &str) -> Result<(), DatabaseError>;

    /// Drop an enumerated type no column uses.
    fn drop_enum(&mut self, name: &str) -> Result<(), DatabaseError>;

    /// Add a foreign key after checking existing rows resolve.
    fn add_foreign_key(&mut self, fk: &ForeignKeyDef) -> Result<(), DatabaseError>;

    /// Drop a foreign key.
    fn drop_foreign_key(&mut self, name: &str) -> Result<(), DatabaseError>;

    /// Number of rows in a table.
    fn row_count(&self, table: &str) -> Result<u64, DatabaseError>;

    /// Rows in primary-key order, starting after `after` (a row key).
    ///
    /// Returns `(row_key, row)` pairs; pass the last key back to continue.
    fn scan(
        &self,
        table: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Row)>, DatabaseError>;

    /// Insert rows, replacing any row with the same primary key.
    fn upsert_rows(&mut self, table: &str, rows: Vec<Row>) -> Result<u64, DatabaseError>;

    /// Set `column` from `expr` on every row (or only where it is NULL).
    fn update_column(
        &mut self,
        table: &str,
        column: &str,
        expr: &Expr,
        only_null: bool,
    ) -> Result<u64, DatabaseError>;

    /// Rows of `fk.table` whose `fk.column` matches no row of `fk.ref_table`.
    fn orphaned_rows(&self, fk: &ForeignKeyDef) -> Result<u64, DatabaseError>;

    /// Execute a raw statement.
    fn execute_raw(&mut self, sql: &str) -> Result<(), DatabaseError>;
}
