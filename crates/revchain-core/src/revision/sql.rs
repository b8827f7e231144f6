//! PostgreSQL rendering of operations, for offline review of a plan.
//!
//! Each rendered statement is re-runnable: guarded operations use
//! `IF [NOT] EXISTS` forms or a `DO` block that checks the catalog first.

use super::operation::{ColumnMapping, Operation, OperationSet};
use crate::schema::{ColumnDef, ColumnType, Expr, ForeignKeyDef, TableDef, Value};

/// Quote an identifier.
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Render a JSON value as a SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => format!("{}::jsonb", quote(&other.to_string())),
    }
}

fn type_name(ty: &ColumnType) -> String {
    match ty {
        ColumnType::Enum(name) => ident(name),
        other => other.sql_name(),
    }
}

/// Render a value expression.
pub fn expr(e: &Expr) -> String {
    match e {
        Expr::Literal { value } => literal(value),
        Expr::Column { name } => ident(name),
        Expr::Map {
            column,
            mapping,
            default,
        } => {
            let mut out = format!("CASE {}::text", ident(column));
            for (from, to) in mapping {
                out.push_str(&format!(" WHEN {} THEN {}", quote(from), literal(to)));
            }
            let fallback = default.as_ref().map(literal).unwrap_or_else(|| "NULL".to_string());
            out.push_str(&format!(" ELSE {} END", fallback));
            out
        }
        Expr::Coalesce { exprs } => {
            let parts: Vec<String> = exprs.iter().map(expr).collect();
            format!("COALESCE({})", parts.join(", "))
        }
    }
}

fn column_def(column: &ColumnDef) -> String {
    let mut out = format!("{} {}", ident(&column.name), type_name(&column.ty));
    if !column.nullable {
        out.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        out.push_str(&format!(" DEFAULT {}", literal(default)));
    }
    out
}

fn create_table(table: &TableDef) -> String {
    let mut parts: Vec<String> = table.columns.iter().map(column_def).collect();
    parts.push(format!("PRIMARY KEY ({})", ident(&table.primary_key)));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        ident(&table.name),
        parts.join(",\n    ")
    )
}

fn add_foreign_key(fk: &ForeignKeyDef) -> String {
    format!(
        "DO $$ BEGIN\n    IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = {}) THEN\n        ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({});\n    END IF;\nEND $$;",
        quote(&fk.name),
        ident(&fk.table),
        ident(&fk.name),
        ident(&fk.column),
        ident(&fk.ref_table),
        ident(&fk.ref_column)
    )
}

fn drop_foreign_key(table: &str, name: &str) -> String {
    format!(
        "ALTER TABLE IF EXISTS {} DROP CONSTRAINT IF EXISTS {};",
        ident(table),
        ident(name)
    )
}

fn rename_table(from: &str, to: &str) -> String {
    format!(
        "DO $$ BEGIN\n    IF to_regclass({}) IS NOT NULL AND to_regclass({}) IS NULL THEN\n        ALTER TABLE {} RENAME TO {};\n    END IF;\nEND $$;",
        quote(from),
        quote(to),
        ident(from),
        ident(to)
    )
}

fn copy_rows(from: &str, to: &str, columns: &[ColumnMapping]) -> String {
    let targets: Vec<String> = columns.iter().map(|m| ident(&m.column)).collect();
    let values: Vec<String> = columns.iter().map(|m| expr(&m.expr)).collect();
    format!(
        "INSERT INTO {} ({})\nSELECT {}\nFROM {}\nON CONFLICT DO NOTHING;",
        ident(to),
        targets.join(", "),
        values.join(", "),
        ident(from)
    )
}

fn retarget(from_table: &str, to_table: &str, constraints: &[String], except: &[String]) -> String {
    let names = |list: &[String]| list.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let mut filter = String::new();
    if !constraints.is_empty() {
        filter.push_str(&format!(" AND conname IN ({})", names(constraints)));
    }
    if !except.is_empty() {
        filter.push_str(&format!(" AND conname NOT IN ({})", names(except)));
    }
    format!(
        "DO $$\nDECLARE r record;\nBEGIN\n    FOR r IN SELECT conrelid::regclass AS tbl, conname, pg_get_constraintdef(oid) AS def\n             FROM pg_constraint WHERE contype = 'f' AND confrelid = {}::regclass{}\n    LOOP\n        EXECUTE format('ALTER TABLE %s DROP CONSTRAINT %I', r.tbl, r.conname);\n        EXECUTE format('ALTER TABLE %s ADD CONSTRAINT %I %s', r.tbl, r.conname,\n            regexp_replace(r.def, 'REFERENCES [^(]+\\(', {}));\n    END LOOP;\nEND $$;",
        quote(&ident(from_table)),
        filter,
        quote(&format!("REFERENCES {}(", ident(to_table)))
    )
}

/// Render one operation as one or more statements.
pub fn render_operation(op: &Operation) -> Vec<String> {
    match op {
        Operation::CreateTable { table } => vec![create_table(table)],
        Operation::DropTable { table } => vec![format!("DROP TABLE IF EXISTS {};", ident(table))],
        Operation::RenameTable { from, to } => vec![rename_table(from, to)],
        Operation::AddColumn { table, column } => vec![format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {};",
            ident(table),
            column_def(column)
        )],
        Operation::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
            ident(table),
            ident(column)
        )],
        Operation::AlterColumnType { table, column, ty } => {
            let cast = match ty {
                ColumnType::Enum(_) => format!("{}::text::{}", ident(column), type_name(ty)),
                _ => format!("{}::{}", ident(column), type_name(ty)),
            };
            vec![format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {};",
                ident(table),
                ident(column),
                type_name(ty),
                cast
            )]
        }
        Operation::CreateEnum { name, values } => {
            let values: Vec<String> = values.iter().map(|v| quote(v)).collect();
            vec![format!(
                "DO $$ BEGIN\n    CREATE TYPE {} AS ENUM ({});\nEXCEPTION WHEN duplicate_object THEN NULL;\nEND $$;",
                ident(name),
                values.join(", ")
            )]
        }
        Operation::AddEnumValues { name, values } => values
            .iter()
            .map(|v| {
                format!(
                    "ALTER TYPE {} ADD VALUE IF NOT EXISTS {};",
                    ident(name),
                    quote(v)
                )
            })
            .collect(),
        Operation::RenameEnum { from, to } => vec![format!(
            "DO $$ BEGIN\n    IF to_regtype({}) IS NOT NULL AND to_regtype({}) IS NULL THEN\n        ALTER TYPE {} RENAME TO {};\n    END IF;\nEND $$;",
            quote(from),
            quote(to),
            ident(from),
            ident(to)
        )],
        Operation::DropEnum { name } => vec![format!("DROP TYPE IF EXISTS {};", ident(name))],
        Operation::Backfill {
            table,
            column,
            expr: value,
            only_null,
        } => {
            let mut stmt = format!(
                "UPDATE {} SET {} = {}",
                ident(table),
                ident(column),
                expr(value)
            );
            if *only_null {
                stmt.push_str(&format!(" WHERE {} IS NULL", ident(column)));
            }
            stmt.push(';');
            vec![stmt]
        }
        Operation::AddForeignKey { constraint } => vec![add_foreign_key(constraint)],
        Operation::DropForeignKey { table, name } => vec![drop_foreign_key(table, name)],
        Operation::InsertRows { table, rows } => rows
            .iter()
            .map(|row| {
                let columns: Vec<String> = row.keys().map(|c| ident(c)).collect();
                let values: Vec<String> = row.values().map(literal).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING;",
                    ident(table),
                    columns.join(", "),
                    values.join(", ")
                )
            })
            .collect(),
        Operation::CopyRows {
            from, to, columns, ..
        } => vec![copy_rows(from, to, columns)],
        Operation::SwapTables {
            production,
            staging,
            backup,
            foreign_keys,
        } => {
            let mut stmts: Vec<String> = foreign_keys
                .iter()
                .map(|fk| drop_foreign_key(&fk.table, &fk.name))
                .collect();
            stmts.push(rename_table(production, backup));
            stmts.push(rename_table(staging, production));
            stmts.extend(
                foreign_keys
                    .iter()
                    .map(|fk| add_foreign_key(&fk.retargeted(production.clone()))),
            );
            stmts
        }
        Operation::RetargetForeignKeys {
            from_table,
            to_table,
            constraints,
            except,
        } => vec![retarget(from_table, to_table, constraints, except)],
        Operation::AssertNoReferences { table } => vec![format!(
            "DO $$ BEGIN\n    IF EXISTS (SELECT 1 FROM pg_constraint WHERE contype = 'f' AND confrelid = to_regclass({})) THEN\n        RAISE EXCEPTION 'table % is still referenced', {};\n    END IF;\nEND $$;",
            quote(table),
            quote(table)
        )],
        Operation::Raw { sql } => vec![sql.clone()],
    }
}

/// Render every operation of a set, in order.
pub fn render_set(set: &OperationSet) -> Vec<String> {
    set.operations().iter().flat_map(render_operation).collect()
}
