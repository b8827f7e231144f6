//! Guarded execution of single operations.
//!
//! Each guarded operation inspects the live schema first and does nothing
//! when its effect is already present. Combined with upsert-based data
//! operations this makes every operation safe to run again after an
//! interruption, which is what resuming a journalled revision relies on.

use super::copy::{copy_rows, CopyConfig};
use super::error::MigrationError;
use super::state::RunJournal;
use super::store::StateStore;
use crate::revision::Operation;
use crate::schema::{Database, DatabaseError, ForeignKeyDef};
use std::collections::BTreeMap;

/// What running one operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation changed the schema or data.
    Applied {
        /// Rows written, for data operations.
        rows: u64,
    },
    /// The effect was already present.
    Skipped {
        /// Why nothing was done.
        reason: String,
    },
}

impl OpOutcome {
    fn applied() -> Self {
        OpOutcome::Applied { rows: 0 }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        OpOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Journal access for the operation being run.
pub(crate) struct StepContext<'a> {
    pub store: &'a StateStore,
    pub journal: &'a mut RunJournal,
    pub index: usize,
    pub batch_size: usize,
    /// Whether backend writes are durable as soon as each call returns.
    pub durable: bool,
}

impl StepContext<'_> {
    fn resume_key(&self) -> Option<String> {
        if !self.durable {
            return None;
        }
        self.journal.step(self.index).and_then(|s| s.last_key.clone())
    }

    fn pending_foreign_keys(&self) -> Vec<ForeignKeyDef> {
        if !self.durable {
            return Vec::new();
        }
        self.journal
            .step(self.index)
            .map(|s| s.pending_foreign_keys.clone())
            .unwrap_or_default()
    }

    fn record_copy(&mut self, processed: u64, last_key: Option<String>) -> Result<(), MigrationError> {
        if let Some(step) = self.journal.step_mut(self.index) {
            step.processed_count = processed;
            step.last_key = last_key;
        }
        self.store.save_journal(self.journal)
    }

    fn record_pending(&mut self, fks: &[ForeignKeyDef]) -> Result<(), MigrationError> {
        if let Some(step) = self.journal.step_mut(self.index) {
            step.pending_foreign_keys = fks.to_vec();
        }
        self.store.save_journal(self.journal)
    }
}

/// Run one operation against the live database.
pub(crate) fn run_operation<D: Database + ?Sized>(
    db: &mut D,
    op: &Operation,
    ctx: &mut StepContext<'_>,
) -> Result<OpOutcome, MigrationError> {
    match op {
        Operation::CreateTable { table } => {
            if db.has_table(&table.name) {
                return Ok(OpOutcome::skipped(format!("table {} exists", table.name)));
            }
            db.create_table(table)?;
        }
        Operation::DropTable { table } => {
            if !db.has_table(table) {
                return Ok(OpOutcome::skipped(format!("table {} is absent", table)));
            }
            db.drop_table(table)?;
        }
        Operation::RenameTable { from, to } => {
            if !db.has_table(from) && db.has_table(to) {
                return Ok(OpOutcome::skipped(format!("table {} already renamed", from)));
            }
            db.rename_table(from, to)?;
        }
        Operation::AddColumn { table, column } => {
            if db.has_column(table, &column.name) {
                return Ok(OpOutcome::skipped(format!(
                    "column {}.{} exists",
                    table, column.name
                )));
            }
            db.add_column(table, column)?;
        }
        Operation::DropColumn { table, column } => {
            if !db.has_column(table, column) {
                return Ok(OpOutcome::skipped(format!(
                    "column {}.{} is absent",
                    table, column
                )));
            }
            db.drop_column(table, column)?;
        }
        Operation::AlterColumnType { table, column, ty } => {
            let current = db
                .table(table)
                .and_then(|t| t.column(column).map(|c| c.ty.clone()));
            if current.as_ref() == Some(ty) {
                return Ok(OpOutcome::skipped(format!(
                    "column {}.{} is already {}",
                    table, column, ty
                )));
            }
            db.alter_column_type(table, column, ty)?;
        }
        Operation::CreateEnum { name, values } => {
            if db.has_enum(name) {
                return Ok(OpOutcome::skipped(format!("enum {} exists", name)));
            }
            db.create_enum(name, values)?;
        }
        Operation::AddEnumValues { name, values } => {
            let present = db.enum_values(name).unwrap_or_default();
            if values.iter().all(|v| present.contains(v)) {
                return Ok(OpOutcome::skipped(format!(
                    "enum {} already holds every value",
                    name
                )));
            }
            let added = db.add_enum_values(name, values)?;
            return Ok(OpOutcome::Applied { rows: added as u64 });
        }
        Operation::RenameEnum { from, to } => {
            if !db.has_enum(from) && db.has_enum(to) {
                return Ok(OpOutcome::skipped(format!("enum {} already renamed", from)));
            }
            db.rename_enum(from, to)?;
        }
        Operation::DropEnum { name } => {
            if !db.has_enum(name) {
                return Ok(OpOutcome::skipped(format!("enum {} is absent", name)));
            }
            db.drop_enum(name)?;
        }
        Operation::Backfill {
            table,
            column,
            expr,
            only_null,
        } => {
            let rows = db.update_column(table, column, expr, *only_null)?;
            return Ok(OpOutcome::Applied { rows });
        }
        Operation::AddForeignKey { constraint } => {
            if db.foreign_key(&constraint.name).as_ref() == Some(constraint) {
                return Ok(OpOutcome::skipped(format!(
                    "constraint {} exists",
                    constraint.name
                )));
            }
            if db.foreign_key(&constraint.name).is_some() {
                db.drop_foreign_key(&constraint.name)?;
            }
            db.add_foreign_key(constraint)?;
        }
        Operation::DropForeignKey { name, .. } => {
            if db.foreign_key(name).is_none() {
                return Ok(OpOutcome::skipped(format!("constraint {} is absent", name)));
            }
            db.drop_foreign_key(name)?;
        }
        Operation::InsertRows { table, rows } => {
            let rows = db.upsert_rows(table, rows.clone())?;
            return Ok(OpOutcome::Applied { rows });
        }
        Operation::CopyRows {
            from,
            to,
            columns,
            batch_size,
        } => {
            let config = CopyConfig {
                batch_size: batch_size.unwrap_or(ctx.batch_size),
            };
            let resume = ctx.resume_key();
            if let Some(key) = &resume {
                tracing::info!(from = %from, to = %to, after = %key, "resuming copy");
            }
            let progress = copy_rows(db, from, to, columns, &config, resume, |p| {
                ctx.record_copy(p.copied, p.last_key.clone())
            })?;
            return Ok(OpOutcome::Applied {
                rows: progress.copied,
            });
        }
        Operation::SwapTables {
            production,
            staging,
            backup,
            foreign_keys,
        } => return swap_tables(db, production, staging, backup, foreign_keys),
        Operation::RetargetForeignKeys {
            from_table,
            to_table,
            constraints,
            except,
        } => return retarget_foreign_keys(db, from_table, to_table, constraints, except, ctx),
        Operation::AssertNoReferences { table } => {
            let inbound = db.references_to(table);
            if !inbound.is_empty() {
                return Err(MigrationError::ReferentialIntegrity {
                    table: table.clone(),
                    constraints: inbound.into_iter().map(|fk| fk.name).collect(),
                });
            }
            return Ok(OpOutcome::skipped(format!("nothing references {}", table)));
        }
        Operation::Raw { sql } => db.execute_raw(sql)?,
    }
    Ok(OpOutcome::applied())
}

/// Promote `staging` to `production`, keeping production as `backup`.
///
/// Every sub-step is guarded, so a swap interrupted between any two of them
/// completes when run again.
fn swap_tables<D: Database + ?Sized>(
    db: &mut D,
    production: &str,
    staging: &str,
    backup: &str,
    foreign_keys: &[ForeignKeyDef],
) -> Result<OpOutcome, MigrationError> {
    let mut changed = false;

    if db.has_table(staging) {
        if db.has_table(production) && db.has_table(backup) {
            return Err(DatabaseError::TableExists(backup.to_string()).into());
        }

        for fk in foreign_keys {
            if db.foreign_key(&fk.name).is_some() {
                db.drop_foreign_key(&fk.name)?;
                changed = true;
            }
        }

        for fk in db.references_to(production) {
            if !foreign_keys.iter().any(|listed| listed.name == fk.name) {
                tracing::warn!(
                    constraint = %fk.name,
                    table = %fk.table,
                    backup,
                    "foreign key not moved by the swap; it will follow {} to {}",
                    production,
                    backup
                );
            }
        }

        if db.has_table(production) {
            db.rename_table(production, backup)?;
        }
        db.rename_table(staging, production)?;
        changed = true;
    } else if !db.has_table(production) {
        return Err(DatabaseError::TableNotFound(staging.to_string()).into());
    }

    for fk in foreign_keys {
        let wanted = fk.retargeted(production);
        match db.foreign_key(&fk.name) {
            Some(live) if live == wanted => continue,
            Some(_) => db.drop_foreign_key(&fk.name)?,
            None => {}
        }
        db.add_foreign_key(&wanted)?;
        changed = true;
    }

    if changed {
        Ok(OpOutcome::applied())
    } else {
        Ok(OpOutcome::skipped(format!("{} already promoted", staging)))
    }
}

/// Repoint foreign keys referencing `from_table` at `to_table`.
///
/// The set being moved is journalled before any constraint is dropped, so a
/// retarget interrupted between drop and add can still find it.
fn retarget_foreign_keys<D: Database + ?Sized>(
    db: &mut D,
    from_table: &str,
    to_table: &str,
    constraints: &[String],
    except: &[String],
    ctx: &mut StepContext<'_>,
) -> Result<OpOutcome, MigrationError> {
    let mut moving: BTreeMap<String, ForeignKeyDef> = ctx
        .pending_foreign_keys()
        .into_iter()
        .map(|fk| (fk.name.clone(), fk))
        .collect();
    for fk in db.references_to(from_table) {
        let listed = constraints.is_empty() || constraints.contains(&fk.name);
        if listed && !except.contains(&fk.name) {
            moving.insert(fk.name.clone(), fk);
        }
    }

    let outstanding: Vec<ForeignKeyDef> = moving
        .into_values()
        .filter(|fk| {
            db.foreign_key(&fk.name)
                .map(|live| live.ref_table != to_table)
                .unwrap_or(true)
        })
        .collect();
    if outstanding.is_empty() {
        return Ok(OpOutcome::skipped(format!(
            "no foreign keys reference {}",
            from_table
        )));
    }
    if !db.has_table(to_table) {
        return Err(DatabaseError::TableNotFound(to_table.to_string()).into());
    }

    ctx.record_pending(&outstanding)?;
    for fk in &outstanding {
        if db.foreign_key(&fk.name).is_some() {
            db.drop_foreign_key(&fk.name)?;
        }
        db.add_foreign_key(&fk.retargeted(to_table))?;
        tracing::info!(
            constraint = %fk.name,
            table = %fk.table,
            from = from_table,
            to = to_table,
            "retargeted foreign key"
        );
    }

    Ok(OpOutcome::Applied {
        rows: outstanding.len() as u64,
    })
}
