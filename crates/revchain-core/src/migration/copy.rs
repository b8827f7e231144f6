//! Batched row copy for staging tables.
//!
//! Rows are read from the source in primary-key order, mapped through the
//! column expressions and upserted into the destination one batch at a
//! time. Re-running a copy overwrites rows already copied, so an
//! interrupted copy can restart from the beginning or from the last
//! checkpointed key.

use super::error::MigrationError;
use crate::revision::ColumnMapping;
use crate::schema::{Database, DatabaseError, Row};
use std::time::Instant;

/// Configuration for batched copies.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Number of rows per batch.
    pub batch_size: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Progress report for a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyProgress {
    /// Source table.
    pub from: String,
    /// Destination table.
    pub to: String,
    /// Rows copied by this invocation.
    pub copied: u64,
    /// Rows in the source when the copy started.
    pub total: u64,
    /// Batches written.
    pub batches: u64,
    /// Key of the last row copied.
    pub last_key: Option<String>,
}

impl CopyProgress {
    fn new(from: &str, to: &str, total: u64, resume_after: Option<String>) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            copied: 0,
            total,
            batches: 0,
            last_key: resume_after,
        }
    }

    /// Calculate percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.copied as f64 / self.total as f64) * 100.0
        }
    }
}

/// Map one source row into a destination row.
pub fn map_row(row: &Row, columns: &[ColumnMapping]) -> Result<Row, DatabaseError> {
    let mut mapped = Row::new();
    for mapping in columns {
        mapped.insert(mapping.column.clone(), mapping.expr.evaluate(row)?);
    }
    Ok(mapped)
}

/// Copy rows from `from` into `to`.
///
/// Starts after `resume_after` when given. `on_batch` runs after each
/// batch is written, with the running progress, so callers can checkpoint.
pub fn copy_rows<D, F>(
    db: &mut D,
    from: &str,
    to: &str,
    columns: &[ColumnMapping],
    config: &CopyConfig,
    resume_after: Option<String>,
    mut on_batch: F,
) -> Result<CopyProgress, MigrationError>
where
    D: Database + ?Sized,
    F: FnMut(&CopyProgress) -> Result<(), MigrationError>,
{
    if !db.has_table(to) {
        return Err(DatabaseError::TableNotFound(to.to_string()).into());
    }
    let batch_size = config.batch_size.max(1);
    let total = db.row_count(from)?;
    let mut progress = CopyProgress::new(from, to, total, resume_after);
    let started = Instant::now();

    loop {
        let batch = db.scan(from, progress.last_key.as_deref(), batch_size)?;
        let Some((last_key, _)) = batch.last() else {
            break;
        };
        let last_key = last_key.clone();
        let fetched = batch.len();

        let rows = batch
            .iter()
            .map(|(_, row)| map_row(row, columns))
            .collect::<Result<Vec<_>, _>>()?;
        progress.copied += db.upsert_rows(to, rows)?;
        progress.batches += 1;
        progress.last_key = Some(last_key);

        tracing::debug!(
            from,
            to,
            batch = progress.batches,
            copied = progress.copied,
            total,
            "copied batch"
        );
        on_batch(&progress)?;

        if fetched < batch_size {
            break;
        }
    }

    tracing::info!(
        from,
        to,
        copied = progress.copied,
        batches = progress.batches,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "copy complete"
    );
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, EmbeddedDatabase, Expr, TableDef};
    use serde_json::json;

    fn setup() -> (EmbeddedDatabase, sled::Db) {
        let (mut db, sled) = EmbeddedDatabase::temporary().unwrap();
        db.create_table(
            &TableDef::new("movements", "id")
                .with_column(ColumnDef::required("id", ColumnType::Integer))
                .with_column(ColumnDef::new("section", ColumnType::Text)),
        )
        .unwrap();
        db.create_table(
            &TableDef::new("new_movements", "id")
                .with_column(ColumnDef::required("id", ColumnType::Integer))
                .with_column(ColumnDef::new("role", ColumnType::Text)),
        )
        .unwrap();
        let rows = (1..=25)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), json!(i));
                row.insert(
                    "section".to_string(),
                    if i % 5 == 0 { json!(null) } else { json!("warm_up") },
                );
                row
            })
            .collect();
        db.upsert_rows("movements", rows).unwrap();
        (db, sled)
    }

    fn mappings() -> Vec<ColumnMapping> {
        vec![
            ColumnMapping::same("id"),
            ColumnMapping::new(
                "role",
                Expr::map("section", [("warm_up", "warmup")]).with_default(json!("main")),
            ),
        ]
    }

    #[test]
    fn test_copy_in_batches() {
        let (mut db, _sled) = setup();
        let mut checkpoints = Vec::new();
        let progress = copy_rows(
            &mut db,
            "movements",
            "new_movements",
            &mappings(),
            &CopyConfig { batch_size: 10 },
            None,
            |p| {
                checkpoints.push(p.copied);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(progress.copied, 25);
        assert_eq!(progress.batches, 3);
        assert_eq!(checkpoints, vec![10, 20, 25]);
        assert_eq!(progress.percent_complete(), 100.0);
        assert_eq!(db.row_count("new_movements").unwrap(), 25);

        let rows = db.rows("new_movements").unwrap();
        assert_eq!(rows[0]["role"], json!("warmup"));
        assert_eq!(rows[3]["role"], json!("warmup"));
        assert_eq!(rows[4]["role"], json!(null));
    }

    #[test]
    fn test_copy_resumes_after_checkpoint() {
        let (mut db, _sled) = setup();
        let mut first_key = None;
        let _ = copy_rows(
            &mut db,
            "movements",
            "new_movements",
            &mappings(),
            &CopyConfig { batch_size: 10 },
            None,
            |p| {
                first_key = p.last_key.clone();
                Err(MigrationError::StateCorrupted {
                    message: "interrupted".to_string(),
                })
            },
        );
        assert_eq!(db.row_count("new_movements").unwrap(), 10);

        let progress = copy_rows(
            &mut db,
            "movements",
            "new_movements",
            &mappings(),
            &CopyConfig { batch_size: 10 },
            first_key,
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(progress.copied, 15);
        assert_eq!(db.row_count("new_movements").unwrap(), 25);
    }

    #[test]
    fn test_copy_requires_destination() {
        let (mut db, _sled) = setup();
        let err = copy_rows(
            &mut db,
            "movements",
            "missing",
            &mappings(),
            &CopyConfig::default(),
            None,
            |_| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Database(DatabaseError::TableNotFound(_))
        ));
    }
}
