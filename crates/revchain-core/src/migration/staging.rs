//! Staged table refactors.
//!
//! A live refactor of a table whose shape changes incompatibly runs as six
//! separately applied revisions:
//!
//! | Phase | Upgrade | Downgrade |
//! |-------|---------|-----------|
//! | `enum_sync` | widen enumerated types | one-way, nothing removed |
//! | `create_staging` | create `new_<table>` | drop `new_<table>` |
//! | `populate` | batched upsert copy into staging | nothing |
//! | `table_swap` | drop listed FKs, rename, rename, recreate FKs | mirrored swap |
//! | `fix_foreign_keys` | retarget FKs left on `old_<table>` | retarget listed FKs back |
//! | `cleanup` | assert unreferenced, drop `old_<table>` | one-way, rebuild backup |
//!
//! At every step a complete copy of the rows exists in production, the
//! backup, or the staging table.

use crate::revision::{ColumnMapping, Operation, OperationSet, RevisionUnit};
use crate::schema::{Expr, ForeignKeyDef, TableDef};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of the table holding the refactored shape before promotion.
pub const STAGING_PREFIX: &str = "new_";

/// Prefix of the retained pre-refactor table.
pub const BACKUP_PREFIX: &str = "old_";

/// Name of the staging table for `table`.
pub fn staging_name(table: &str) -> String {
    format!("{}{}", STAGING_PREFIX, table)
}

/// Name of the backup table for `table`.
pub fn backup_name(table: &str) -> String {
    format!("{}{}", BACKUP_PREFIX, table)
}

/// A phase of the staging protocol, in required order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    /// Widen enumerated types to the union of old and new values.
    EnumSync,
    /// Create the staging table with the target shape.
    CreateStaging,
    /// Copy rows from production into staging.
    Populate,
    /// Promote staging over production.
    TableSwap,
    /// Retarget foreign keys the swap left on the backup.
    FixForeignKeys,
    /// Drop the backup.
    Cleanup,
}

impl StagePhase {
    /// All phases in protocol order.
    pub const ORDER: [StagePhase; 6] = [
        StagePhase::EnumSync,
        StagePhase::CreateStaging,
        StagePhase::Populate,
        StagePhase::TableSwap,
        StagePhase::FixForeignKeys,
        StagePhase::Cleanup,
    ];

    /// Position in the protocol, starting at zero.
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// The phase that follows this one.
    pub fn next(self) -> Option<StagePhase> {
        Self::ORDER.get(self.ordinal() + 1).copied()
    }

    /// Whether the downgrade of this phase restores the prior state exactly.
    pub fn is_reversible(self) -> bool {
        !matches!(self, StagePhase::EnumSync | StagePhase::Cleanup)
    }

    /// Snake case name used in revision files and ids.
    pub fn as_str(self) -> &'static str {
        match self {
            StagePhase::EnumSync => "enum_sync",
            StagePhase::CreateStaging => "create_staging",
            StagePhase::Populate => "populate",
            StagePhase::TableSwap => "table_swap",
            StagePhase::FixForeignKeys => "fix_foreign_keys",
            StagePhase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StagePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .copied()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| format!("unknown stage phase '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EnumChange {
    Create { name: String, values: Vec<String> },
    Widen { name: String, values: Vec<String> },
}

/// Builder for the six revisions of one staged table refactor.
#[derive(Debug, Clone)]
pub struct StagedRefactor {
    name: String,
    previous: TableDef,
    target: TableDef,
    enums: Vec<EnumChange>,
    populate: Vec<ColumnMapping>,
    restore: Vec<ColumnMapping>,
    swap_foreign_keys: Vec<ForeignKeyDef>,
    late_foreign_keys: Vec<String>,
    batch_size: Option<usize>,
}

impl StagedRefactor {
    /// Refactor the production table `previous` into the shape `target`.
    ///
    /// The target is renamed to the production name if it differs.
    pub fn new(previous: TableDef, target: TableDef) -> Self {
        let target = target.renamed(previous.name.clone());
        Self {
            name: previous.name.clone(),
            previous,
            target,
            enums: Vec::new(),
            populate: Vec::new(),
            restore: Vec::new(),
            swap_foreign_keys: Vec::new(),
            late_foreign_keys: Vec::new(),
            batch_size: None,
        }
    }

    /// Override the refactor tag, which also prefixes the revision ids.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Ensure an existing enumerated type holds `values`.
    pub fn widen_enum<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enums.push(EnumChange::Widen {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Create an enumerated type the target shape needs.
    pub fn create_enum<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enums.push(EnumChange::Create {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Fill a staging column from production rows.
    pub fn populate(mut self, column: impl Into<String>, expr: Expr) -> Self {
        self.populate.push(ColumnMapping::new(column, expr));
        self
    }

    /// Fill a rebuilt backup column from promoted rows when Cleanup is undone.
    pub fn restore(mut self, column: impl Into<String>, expr: Expr) -> Self {
        self.restore.push(ColumnMapping::new(column, expr));
        self
    }

    /// Move an inbound foreign key onto the promoted table during the swap.
    pub fn swap_foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.swap_foreign_keys.push(fk);
        self
    }

    /// Name a foreign key the swap does not move.
    ///
    /// Such constraints follow production to the backup and are retargeted
    /// by the FixForeignKeys phase. Without any named, the downgrade moves
    /// every inbound constraint the swap does not own back to the backup;
    /// naming some narrows it to those.
    pub fn late_foreign_key(mut self, name: impl Into<String>) -> Self {
        self.late_foreign_keys.push(name.into());
        self
    }

    /// Rows per batch for the Populate copy.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// The refactor tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Production table name.
    pub fn table(&self) -> &str {
        &self.previous.name
    }

    /// Id of the revision implementing `phase`.
    pub fn revision_id(&self, phase: StagePhase) -> String {
        format!("{}_{}", self.name, phase)
    }

    fn populate_mappings(&self) -> Vec<ColumnMapping> {
        let mut mappings = self.populate.clone();
        for column in &self.target.columns {
            let mapped = mappings.iter().any(|m| m.column == column.name);
            if !mapped && self.previous.has_column(&column.name) {
                mappings.push(ColumnMapping::same(column.name.clone()));
            }
        }
        mappings
    }

    fn restore_mappings(&self) -> Vec<ColumnMapping> {
        let mut mappings = self.restore.clone();
        for column in &self.previous.columns {
            let mapped = mappings.iter().any(|m| m.column == column.name);
            if !mapped && self.target.has_column(&column.name) {
                mappings.push(ColumnMapping::same(column.name.clone()));
            }
        }
        mappings
    }

    fn phase_sets(&self, phase: StagePhase) -> (OperationSet, OperationSet) {
        let table = self.table().to_string();
        let staging = staging_name(&table);
        let backup = backup_name(&table);

        match phase {
            StagePhase::EnumSync => {
                let ops = self
                    .enums
                    .iter()
                    .map(|change| match change {
                        EnumChange::Create { name, values } => Operation::CreateEnum {
                            name: name.clone(),
                            values: values.clone(),
                        },
                        EnumChange::Widen { name, values } => Operation::AddEnumValues {
                            name: name.clone(),
                            values: values.clone(),
                        },
                    })
                    .collect();
                (
                    OperationSet::reversible(ops),
                    OperationSet::one_way("enumerated type values cannot be removed", Vec::new()),
                )
            }
            StagePhase::CreateStaging => (
                OperationSet::reversible(vec![Operation::CreateTable {
                    table: self.target.renamed(staging.clone()),
                }]),
                OperationSet::reversible(vec![Operation::DropTable { table: staging }]),
            ),
            StagePhase::Populate => (
                OperationSet::reversible(vec![Operation::CopyRows {
                    from: table,
                    to: staging,
                    columns: self.populate_mappings(),
                    batch_size: self.batch_size,
                }]),
                OperationSet::reversible(Vec::new()),
            ),
            StagePhase::TableSwap => (
                OperationSet::reversible(vec![Operation::SwapTables {
                    production: table.clone(),
                    staging: staging.clone(),
                    backup: backup.clone(),
                    foreign_keys: self.swap_foreign_keys.clone(),
                }]),
                OperationSet::reversible(vec![Operation::SwapTables {
                    production: table,
                    staging: backup,
                    backup: staging,
                    foreign_keys: self.swap_foreign_keys.clone(),
                }]),
            ),
            StagePhase::FixForeignKeys => (
                OperationSet::reversible(vec![Operation::RetargetForeignKeys {
                    from_table: backup.clone(),
                    to_table: table.clone(),
                    constraints: Vec::new(),
                    except: Vec::new(),
                }]),
                OperationSet::reversible(vec![Operation::RetargetForeignKeys {
                    from_table: table,
                    to_table: backup,
                    constraints: self.late_foreign_keys.clone(),
                    except: self.swap_foreign_keys.iter().map(|fk| fk.name.clone()).collect(),
                }]),
            ),
            StagePhase::Cleanup => (
                OperationSet::one_way(
                    format!("drops the backup table {}", backup),
                    vec![
                        Operation::AssertNoReferences {
                            table: backup.clone(),
                        },
                        Operation::DropTable {
                            table: backup.clone(),
                        },
                    ],
                ),
                OperationSet::one_way(
                    format!(
                        "rebuilds {} from {}; values only the new shape can hold are mapped or lost",
                        backup, table
                    ),
                    vec![
                        Operation::CreateTable {
                            table: self.previous.renamed(backup.clone()),
                        },
                        Operation::CopyRows {
                            from: table,
                            to: backup,
                            columns: self.restore_mappings(),
                            batch_size: self.batch_size,
                        },
                    ],
                ),
            ),
        }
    }

    /// Generate the six revisions, chained from `parent`.
    ///
    /// Creation times start at `start` and advance one second per phase.
    pub fn revisions(&self, parent: Option<&str>, start: DateTime<Utc>) -> Vec<RevisionUnit> {
        let mut parent = parent.map(str::to_string);
        let mut units = Vec::with_capacity(StagePhase::ORDER.len());

        for (offset, phase) in StagePhase::ORDER.iter().copied().enumerate() {
            let id = self.revision_id(phase);
            let (upgrade, downgrade) = self.phase_sets(phase);
            let unit = RevisionUnit::new(
                id.clone(),
                parent.take(),
                start + Duration::seconds(offset as i64),
            )
            .with_message(format!("{}: {}", self.name, phase.as_str().replace('_', " ")))
            .with_phase(self.name.clone(), phase)
            .with_upgrade(upgrade)
            .with_downgrade(downgrade);

            units.push(unit);
            parent = Some(id);
        }
        units
    }
}
