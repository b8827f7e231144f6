//! Schema and data operations, and the tagged sets they are grouped into.

use crate::schema::{ColumnDef, ColumnType, Expr, ForeignKeyDef, Row, TableDef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target column of a staging copy and the expression that fills it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Column in the destination table.
    pub column: String,
    /// Value computed from the source row.
    pub expr: Expr,
}

impl ColumnMapping {
    /// Map a destination column to an expression.
    pub fn new(column: impl Into<String>, expr: Expr) -> Self {
        Self {
            column: column.into(),
            expr,
        }
    }

    /// Copy a column unchanged.
    pub fn same(column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            expr: Expr::column(column.clone()),
            column,
        }
    }
}

/// A single schema or data operation.
///
/// Every variant except `backfill`, `copy_rows`, `insert_rows`,
/// `assert_no_references` and `raw` is guarded: the engine checks the live
/// schema first and skips the operation when its effect is already present.
/// The unguarded data operations are idempotent by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a table.
    CreateTable {
        /// Table definition.
        table: TableDef,
    },
    /// Drop a table and its rows.
    DropTable {
        /// Table name.
        table: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Add a column.
    AddColumn {
        /// Table name.
        table: String,
        /// Column definition.
        column: ColumnDef,
    },
    /// Drop a column and its data.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Change a column's type.
    AlterColumnType {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// New type.
        #[serde(rename = "type")]
        ty: ColumnType,
    },
    /// Create an enumerated type.
    CreateEnum {
        /// Type name.
        name: String,
        /// Values in order.
        values: Vec<String>,
    },
    /// Widen an enumerated type with any values it lacks.
    AddEnumValues {
        /// Type name.
        name: String,
        /// Values to ensure are present.
        values: Vec<String>,
    },
    /// Rename an enumerated type.
    RenameEnum {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Drop an enumerated type.
    DropEnum {
        /// Type name.
        name: String,
    },
    /// Compute a column's values from each row.
    Backfill {
        /// Table name.
        table: String,
        /// Column to fill.
        column: String,
        /// Value expression.
        expr: Expr,
        /// Only touch rows where the column is NULL.
        #[serde(default)]
        only_null: bool,
    },
    /// Add a foreign key constraint.
    AddForeignKey {
        /// Constraint definition.
        constraint: ForeignKeyDef,
    },
    /// Drop a foreign key constraint.
    DropForeignKey {
        /// Table the constraint is defined on.
        table: String,
        /// Constraint name.
        name: String,
    },
    /// Upsert literal rows.
    InsertRows {
        /// Table name.
        table: String,
        /// Rows to write.
        rows: Vec<Row>,
    },
    /// Batched, re-runnable upsert copy from one table into another.
    CopyRows {
        /// Source table.
        from: String,
        /// Destination table.
        to: String,
        /// Destination columns and how to compute them.
        columns: Vec<ColumnMapping>,
        /// Rows per batch; the configured batch size when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<usize>,
    },
    /// Promote a staging table over production, keeping production as a backup.
    ///
    /// Runs in a strict order: drop the listed inbound foreign keys, rename
    /// production to the backup name, rename staging to production, then
    /// recreate the foreign keys against the promoted table.
    SwapTables {
        /// Name that ends up holding the promoted rows.
        production: String,
        /// Table being promoted.
        staging: String,
        /// Name the current production table is moved to.
        backup: String,
        /// Inbound constraints to move onto the promoted table.
        #[serde(default)]
        foreign_keys: Vec<ForeignKeyDef>,
    },
    /// Repoint foreign keys from one table to another.
    ///
    /// With an empty `constraints` list every foreign key referencing
    /// `from_table` is retargeted, minus those named in `except`.
    RetargetForeignKeys {
        /// Table currently referenced.
        from_table: String,
        /// Table to reference instead.
        to_table: String,
        /// Constraint names to move; all inbound constraints when empty.
        #[serde(default)]
        constraints: Vec<String>,
        /// Constraint names to leave in place.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        except: Vec<String>,
    },
    /// Fail unless no foreign key references `table`.
    AssertNoReferences {
        /// Table name.
        table: String,
    },
    /// A raw statement passed to the backend verbatim.
    Raw {
        /// Statement text.
        sql: String,
    },
}

impl Operation {
    /// Short name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateTable { .. } => "create_table",
            Operation::DropTable { .. } => "drop_table",
            Operation::RenameTable { .. } => "rename_table",
            Operation::AddColumn { .. } => "add_column",
            Operation::DropColumn { .. } => "drop_column",
            Operation::AlterColumnType { .. } => "alter_column_type",
            Operation::CreateEnum { .. } => "create_enum",
            Operation::AddEnumValues { .. } => "add_enum_values",
            Operation::RenameEnum { .. } => "rename_enum",
            Operation::DropEnum { .. } => "drop_enum",
            Operation::Backfill { .. } => "backfill",
            Operation::AddForeignKey { .. } => "add_foreign_key",
            Operation::DropForeignKey { .. } => "drop_foreign_key",
            Operation::InsertRows { .. } => "insert_rows",
            Operation::CopyRows { .. } => "copy_rows",
            Operation::SwapTables { .. } => "swap_tables",
            Operation::RetargetForeignKeys { .. } => "retarget_foreign_keys",
            Operation::AssertNoReferences { .. } => "assert_no_references",
            Operation::Raw { .. } => "raw",
        }
    }

    /// Whether the operation discards data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Operation::DropTable { .. } | Operation::DropColumn { .. } | Operation::DropEnum { .. }
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable { table } => write!(f, "create table {}", table.name),
            Operation::DropTable { table } => write!(f, "drop table {}", table),
            Operation::RenameTable { from, to } => write!(f, "rename table {} to {}", from, to),
            Operation::AddColumn { table, column } => {
                write!(f, "add column {}.{} {}", table, column.name, column.ty)
            }
            Operation::DropColumn { table, column } => write!(f, "drop column {}.{}", table, column),
            Operation::AlterColumnType { table, column, ty } => {
                write!(f, "alter column {}.{} type {}", table, column, ty)
            }
            Operation::CreateEnum { name, values } => {
                write!(f, "create enum {} ({})", name, values.join(", "))
            }
            Operation::AddEnumValues { name, values } => {
                write!(f, "widen enum {} with ({})", name, values.join(", "))
            }
            Operation::RenameEnum { from, to } => write!(f, "rename enum {} to {}", from, to),
            Operation::DropEnum { name } => write!(f, "drop enum {}", name),
            Operation::Backfill { table, column, .. } => write!(f, "backfill {}.{}", table, column),
            Operation::AddForeignKey { constraint } => write!(
                f,
                "add foreign key {} ({}.{} -> {}.{})",
                constraint.name,
                constraint.table,
                constraint.column,
                constraint.ref_table,
                constraint.ref_column
            ),
            Operation::DropForeignKey { table, name } => {
                write!(f, "drop foreign key {} on {}", name, table)
            }
            Operation::InsertRows { table, rows } => {
                write!(f, "insert {} row(s) into {}", rows.len(), table)
            }
            Operation::CopyRows { from, to, .. } => write!(f, "copy rows {} -> {}", from, to),
            Operation::SwapTables {
                production,
                staging,
                backup,
                ..
            } => write!(
                f,
                "swap {} into {} (backup {})",
                staging, production, backup
            ),
            Operation::RetargetForeignKeys {
                from_table,
                to_table,
                ..
            } => write!(f, "retarget foreign keys {} -> {}", from_table, to_table),
            Operation::AssertNoReferences { table } => {
                write!(f, "assert nothing references {}", table)
            }
            Operation::Raw { sql } => write!(f, "raw: {}", sql),
        }
    }
}

/// An ordered set of operations, tagged by whether it is a faithful inverse.
///
/// A `one_way` downgrade set only approximates the prior state (its
/// operations are best effort and may be empty); a `one_way` upgrade set is
/// destructive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationSet {
    /// Operations with an exact counterpart in the other direction.
    Reversible {
        /// Operations in execution order.
        #[serde(default)]
        operations: Vec<Operation>,
    },
    /// Operations that cannot be faithfully undone.
    OneWay {
        /// Why the step is one-way.
        reason: String,
        /// Best-effort operations in execution order.
        #[serde(default)]
        operations: Vec<Operation>,
    },
}

impl Default for OperationSet {
    fn default() -> Self {
        OperationSet::Reversible {
            operations: Vec::new(),
        }
    }
}

impl OperationSet {
    /// A reversible set.
    pub fn reversible(operations: Vec<Operation>) -> Self {
        OperationSet::Reversible { operations }
    }

    /// A one-way set.
    pub fn one_way(reason: impl Into<String>, operations: Vec<Operation>) -> Self {
        OperationSet::OneWay {
            reason: reason.into(),
            operations,
        }
    }

    /// Operations in execution order.
    pub fn operations(&self) -> &[Operation] {
        match self {
            OperationSet::Reversible { operations } | OperationSet::OneWay { operations, .. } => {
                operations
            }
        }
    }

    /// Whether this set is tagged one-way.
    pub fn is_one_way(&self) -> bool {
        matches!(self, OperationSet::OneWay { .. })
    }

    /// The one-way reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            OperationSet::OneWay { reason, .. } => Some(reason),
            OperationSet::Reversible { .. } => None,
        }
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations().len()
    }

    /// Whether the set has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations().is_empty()
    }
}
