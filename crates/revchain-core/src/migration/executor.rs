//! Migration executor - runs revisions against a live database.
//!
//! One [`Migrator`] owns the revision graph, the state store and the
//! database. A run takes the advisory lock, resolves a plan, checks it
//! statically, then applies each revision in order. Each revision's
//! operations run inside a backend transaction when the backend supports
//! transactional DDL, and are journalled one by one otherwise.

use super::apply::{run_operation, OpOutcome, StepContext};
use super::error::MigrationError;
use super::graph::{RevisionGraph, Target};
use super::plan::MigrationPlan;
use super::staging::BACKUP_PREFIX;
use super::state::{AppliedRecord, HistoryEntry, LockRecord, RunJournal, SchemaState};
use super::store::{LockGuard, StateStore};
use crate::error::current_timestamp;
use crate::revision::{Direction, RevisionUnit};
use crate::schema::{Database, ForeignKeyDef};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Migration executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Rows per batch for copies that do not set their own.
    pub batch_size: usize,
    /// Whether to run one-way (destructive) upgrade sets.
    pub allow_destructive: bool,
    /// Whether a one-way downgrade set is an error rather than a warning.
    pub strict_irreversible: bool,
    /// Whether to compare applied revisions against their recorded checksums.
    pub verify_checksums: bool,
    /// Whether to resolve and validate without executing anything.
    pub dry_run: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            allow_destructive: false,
            strict_irreversible: false,
            verify_checksums: true,
            dry_run: false,
        }
    }
}

impl MigrationConfig {
    /// Set the copy batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Allow or refuse destructive upgrades.
    pub fn with_allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Make one-way downgrades fatal.
    pub fn with_strict_irreversible(mut self, strict: bool) -> Self {
        self.strict_irreversible = strict;
        self
    }

    /// Enable or disable checksum verification.
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Outcome of applying one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// Revision id.
    pub revision: String,
    /// Direction applied.
    pub direction: Direction,
    /// Operations in the set.
    pub operations: usize,
    /// Operations that changed something.
    pub applied: usize,
    /// Operations whose effect was already present.
    pub skipped: usize,
    /// Rows written by data operations.
    pub rows: u64,
    /// Wall time spent (microseconds).
    pub duration_micros: u64,
    /// Whether nothing was executed.
    pub dry_run: bool,
}

impl ApplyReport {
    fn new(revision: &str, direction: Direction, operations: usize) -> Self {
        Self {
            revision: revision.to_string(),
            direction,
            operations,
            applied: 0,
            skipped: 0,
            rows: 0,
            duration_micros: 0,
            dry_run: false,
        }
    }
}

/// Result of an upgrade or downgrade run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The plan that was executed.
    pub plan: MigrationPlan,
    /// One report per revision applied.
    pub applied: Vec<ApplyReport>,
    /// Pointers after the run (projected, for a dry run).
    pub state: SchemaState,
    /// Whether nothing was executed.
    pub dry_run: bool,
}

impl RunReport {
    /// Last revision the run applied.
    pub fn last_applied(&self) -> Option<&str> {
        self.applied.last().map(|r| r.revision.as_str())
    }

    /// Whether the schema was already at the target.
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty()
    }
}

/// Result of a repair.
#[derive(Debug, Clone)]
pub struct RepairReport {
    /// The journalled apply that was resumed.
    pub resumed: Option<ApplyReport>,
    /// Pointers after the repair.
    pub state: SchemaState,
    /// Foreign keys still referencing a backup table.
    pub dangling_foreign_keys: Vec<ForeignKeyDef>,
}

/// Snapshot of migration status.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Current pointers.
    pub state: SchemaState,
    /// Heads of the revision graph.
    pub heads: Vec<String>,
    /// Revisions not yet applied, in upgrade order.
    pub pending: Vec<String>,
    /// Journal of an interrupted apply.
    pub journal: Option<RunJournal>,
    /// Current lock holder.
    pub lock: Option<LockRecord>,
    /// Applied revisions whose content changed since.
    pub modified: Vec<String>,
}

/// Applies revisions from a graph to a database.
pub struct Migrator<D: Database> {
    graph: RevisionGraph,
    store: StateStore,
    db: D,
    config: MigrationConfig,
    owner: String,
}

impl<D: Database> Migrator<D> {
    /// Create a migrator.
    pub fn new(graph: RevisionGraph, db: D, store: StateStore, config: MigrationConfig) -> Self {
        Self {
            graph,
            store,
            db,
            config,
            owner: "revchain".to_string(),
        }
    }

    /// Build the graph from `units` and open the state store in `state_db`.
    pub fn open(
        units: Vec<RevisionUnit>,
        db: D,
        state_db: &sled::Db,
        config: MigrationConfig,
    ) -> Result<Self, MigrationError> {
        let graph = RevisionGraph::new(units)?;
        let store = StateStore::open(state_db)?;
        Ok(Self::new(graph, db, store, config))
    }

    /// Name recorded in the lock while this migrator runs.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// The revision graph.
    pub fn graph(&self) -> &RevisionGraph {
        &self.graph
    }

    /// The state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The database.
    pub fn database(&self) -> &D {
        &self.db
    }

    /// The database (mutable).
    pub fn database_mut(&mut self) -> &mut D {
        &mut self.db
    }

    /// Give back the database.
    pub fn into_database(self) -> D {
        self.db
    }

    /// The configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Replace the configuration.
    pub fn set_config(&mut self, config: MigrationConfig) {
        self.config = config;
    }

    /// Current pointers.
    pub fn state(&self) -> Result<SchemaState, MigrationError> {
        self.store.load_state()
    }

    /// Resolve the plan a run would execute.
    pub fn plan(&self, direction: Direction, target: &Target) -> Result<MigrationPlan, MigrationError> {
        let state = self.store.load_state()?;
        MigrationPlan::build(&self.graph, &state, direction, target)
    }

    /// Upgrade to `target`.
    pub fn upgrade(&mut self, target: &Target) -> Result<RunReport, MigrationError> {
        self.run(Direction::Up, target)
    }

    /// Downgrade to `target`.
    pub fn downgrade(&mut self, target: &Target) -> Result<RunReport, MigrationError> {
        self.run(Direction::Down, target)
    }

    /// Apply a single revision in one direction.
    ///
    /// `state` must be the current persisted pointers; it is advanced only
    /// after every operation succeeds.
    pub fn apply(
        &mut self,
        revision: &str,
        direction: Direction,
        state: &mut SchemaState,
    ) -> Result<ApplyReport, MigrationError> {
        let _lock = self.lock()?;
        let stored = self.store.load_state()?;
        if stored != *state {
            return Err(MigrationError::StateCorrupted {
                message: format!("given state '{}' differs from stored state '{}'", state, stored),
            });
        }
        self.graph.validate_state(state)?;
        self.check_journal(Some((revision, direction)))?;
        if self.config.verify_checksums {
            self.verify_checksums()?;
        }
        self.apply_locked(revision, direction, state)
    }

    /// Resume an interrupted apply from its journal.
    ///
    /// Guarded operations make re-running the journalled revision safe
    /// whatever point it stopped at. Afterwards any foreign key still
    /// referencing a backup table is reported.
    pub fn repair(&mut self) -> Result<RepairReport, MigrationError> {
        let _lock = self.lock()?;
        let mut state = self.store.load_state()?;
        self.graph.validate_state(&state)?;

        let resumed = match self.store.journal()? {
            Some(journal) => {
                tracing::info!(
                    revision = %journal.revision,
                    direction = %journal.direction,
                    finished = journal.finished_steps(),
                    total = journal.steps.len(),
                    "resuming interrupted apply"
                );
                let report = self.apply_locked(&journal.revision, journal.direction, &mut state)?;
                if !self.config.dry_run && self.store.journal()?.is_some() {
                    self.store.clear_journal()?;
                }
                Some(report)
            }
            None => {
                tracing::info!("no interrupted apply to resume");
                None
            }
        };

        let dangling: Vec<ForeignKeyDef> = self
            .db
            .foreign_keys()
            .into_iter()
            .filter(|fk| fk.ref_table.starts_with(BACKUP_PREFIX))
            .collect();
        for fk in &dangling {
            tracing::warn!(
                constraint = %fk.name,
                table = %fk.table,
                references = %fk.ref_table,
                "foreign key still references a backup table"
            );
        }

        Ok(RepairReport {
            resumed,
            state,
            dangling_foreign_keys: dangling,
        })
    }

    /// Current status.
    pub fn status(&self) -> Result<StatusReport, MigrationError> {
        let state = self.store.load_state()?;
        self.graph.validate_state(&state)?;
        Ok(StatusReport {
            pending: self.graph.upgrade_path(&state, &Target::Heads)?,
            heads: self.graph.heads().into_iter().map(str::to_string).collect(),
            state,
            journal: self.store.journal()?,
            lock: self.store.lock_record()?,
            modified: self.modified_revisions()?,
        })
    }

    /// Applied and reverted revisions, oldest first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        self.store.history()
    }

    /// Force-release the advisory lock.
    pub fn unlock(&self) -> Result<Option<LockRecord>, MigrationError> {
        let released = self.store.force_unlock()?;
        if let Some(lock) = &released {
            tracing::warn!(owner = %lock.owner, pid = lock.pid, "released migration lock");
        }
        Ok(released)
    }

    /// Applied revisions whose checksum no longer matches.
    pub fn modified_revisions(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self
            .store
            .applied_records()?
            .into_iter()
            .filter(|record| {
                self.graph
                    .get(&record.revision)
                    .map(|unit| unit.checksum() != record.checksum)
                    .unwrap_or(false)
            })
            .map(|record| record.revision)
            .collect())
    }

    fn verify_checksums(&self) -> Result<(), MigrationError> {
        for record in self.store.applied_records()? {
            if let Some(unit) = self.graph.get(&record.revision) {
                let current = unit.checksum();
                if current != record.checksum {
                    return Err(MigrationError::RevisionModified {
                        revision: record.revision,
                        recorded: record.checksum,
                        current,
                    });
                }
            }
        }
        Ok(())
    }

    /// Refuse to start while a non-transactional apply of another revision
    /// is unfinished.
    fn check_journal(&self, next: Option<(&str, Direction)>) -> Result<(), MigrationError> {
        let Some(journal) = self.store.journal()? else {
            return Ok(());
        };
        if let Some((revision, direction)) = next {
            if journal.matches(revision, direction) {
                return Ok(());
            }
        }
        if journal.transactional && self.config.dry_run {
            tracing::info!(
                revision = %journal.revision,
                direction = %journal.direction,
                "journal of a rolled back apply left in place by dry run"
            );
            return Ok(());
        }
        if journal.transactional {
            tracing::info!(
                revision = %journal.revision,
                direction = %journal.direction,
                "discarding journal of a rolled back apply"
            );
            return self.store.clear_journal();
        }
        Err(MigrationError::InterruptedRun {
            revision: journal.revision,
            direction: journal.direction,
        })
    }

    fn check_plan(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        self.check_journal(
            plan.steps
                .first()
                .map(|step| (step.revision.as_str(), step.direction)),
        )?;
        if self.config.verify_checksums {
            self.verify_checksums()?;
        }
        for step in &plan.steps {
            let Some(reason) = &step.one_way else {
                continue;
            };
            match step.direction {
                Direction::Up if !self.config.allow_destructive => {
                    return Err(MigrationError::UnsafeOperation {
                        revision: step.revision.clone(),
                        reason: reason.clone(),
                    })
                }
                Direction::Down if self.config.strict_irreversible => {
                    return Err(MigrationError::IrreversibleStep {
                        revision: step.revision.clone(),
                        reason: reason.clone(),
                    })
                }
                _ => {}
            }
        }
        for warning in &plan.warnings {
            tracing::warn!("{}", warning);
        }
        Ok(())
    }

    /// Take the advisory lock; dry runs write nothing, the lock included.
    fn lock(&self) -> Result<Option<LockGuard>, MigrationError> {
        if self.config.dry_run {
            return Ok(None);
        }
        self.store.lock(self.owner.clone()).map(Some)
    }

    fn run(&mut self, direction: Direction, target: &Target) -> Result<RunReport, MigrationError> {
        let _lock = self.lock()?;
        let mut state = self.store.load_state()?;
        let plan = MigrationPlan::build(&self.graph, &state, direction, target)?;
        self.check_plan(&plan)?;

        let mut report = RunReport {
            plan: plan.clone(),
            applied: Vec::with_capacity(plan.len()),
            state: state.clone(),
            dry_run: self.config.dry_run,
        };
        if plan.is_empty() {
            tracing::info!(%direction, %target, state = %state, "already at target");
            return Ok(report);
        }
        tracing::info!(
            %direction,
            %target,
            from = %state,
            revisions = plan.len(),
            dry_run = self.config.dry_run,
            "starting run"
        );

        for step in &plan.steps {
            match self.apply_locked(&step.revision, direction, &mut state) {
                Ok(applied) => report.applied.push(applied),
                Err(source) => {
                    let last_applied = report
                        .last_applied()
                        .map(str::to_string)
                        .or_else(|| (!state.is_base()).then(|| state.to_string()));
                    tracing::error!(
                        revision = %step.revision,
                        %direction,
                        last_applied = last_applied.as_deref().unwrap_or("base"),
                        error = %source,
                        "run halted"
                    );
                    return Err(MigrationError::RunHalted {
                        last_applied,
                        source: Box::new(source),
                    });
                }
            }
        }

        tracing::info!(%direction, state = %state, revisions = report.applied.len(), "run complete");
        report.state = state;
        Ok(report)
    }

    fn apply_locked(
        &mut self,
        revision: &str,
        direction: Direction,
        state: &mut SchemaState,
    ) -> Result<ApplyReport, MigrationError> {
        let unit = self.graph.require(revision)?.clone();
        let set = unit.operations(direction);
        let applied = self.graph.applied(state)?;

        match direction {
            Direction::Up => {
                if applied.contains(revision) {
                    tracing::debug!(revision, "already applied");
                    return Ok(ApplyReport::new(revision, direction, 0));
                }
                if let Some(parent) = unit.parents.iter().find(|p| !applied.contains(*p)) {
                    return Err(MigrationError::ParentNotApplied {
                        revision: revision.to_string(),
                        parent: parent.clone(),
                    });
                }
            }
            Direction::Down => {
                if !applied.contains(revision) {
                    tracing::debug!(revision, "not applied");
                    return Ok(ApplyReport::new(revision, direction, 0));
                }
                if let Some(child) = self
                    .graph
                    .children(revision)
                    .iter()
                    .find(|c| applied.contains(*c))
                {
                    return Err(MigrationError::ChildApplied {
                        revision: revision.to_string(),
                        child: child.clone(),
                    });
                }
            }
        }

        if let Some(reason) = set.reason() {
            match direction {
                Direction::Up if !self.config.allow_destructive => {
                    return Err(MigrationError::UnsafeOperation {
                        revision: revision.to_string(),
                        reason: reason.to_string(),
                    })
                }
                Direction::Down if self.config.strict_irreversible => {
                    return Err(MigrationError::IrreversibleStep {
                        revision: revision.to_string(),
                        reason: reason.to_string(),
                    })
                }
                Direction::Up => tracing::warn!(revision, reason, "running destructive upgrade"),
                Direction::Down if set.is_empty() => {
                    tracing::warn!(revision, reason, "one-way downgrade accepted as a no-op")
                }
                Direction::Down => {
                    tracing::warn!(revision, reason, "one-way downgrade runs best effort")
                }
            }
        }

        let mut report = ApplyReport::new(revision, direction, set.len());
        let mut next = state.clone();
        next.record(&self.graph, &unit, direction)?;

        if self.config.dry_run {
            tracing::info!(revision, %direction, operations = set.len(), "dry run");
            report.dry_run = true;
            *state = next;
            return Ok(report);
        }

        let transactional = self.db.supports_transactional_ddl();
        let mut journal = match self.store.journal()? {
            Some(journal)
                if journal.matches(revision, direction)
                    && !journal.transactional
                    && !transactional
                    && journal.steps.len() == set.len() =>
            {
                tracing::info!(
                    revision,
                    %direction,
                    finished = journal.finished_steps(),
                    "resuming from journal"
                );
                journal
            }
            _ => RunJournal::new(revision, direction, set.len(), transactional),
        };
        self.store.save_journal(&journal)?;

        let started = Instant::now();
        if transactional {
            self.db.begin()?;
        }

        for (index, op) in set.operations().iter().enumerate() {
            if let Some(step) = journal.step_mut(index) {
                step.start();
            }
            if !transactional {
                self.store.save_journal(&journal)?;
            }

            let outcome = {
                let mut ctx = StepContext {
                    store: &self.store,
                    journal: &mut journal,
                    index,
                    batch_size: self.config.batch_size,
                    durable: !transactional,
                };
                run_operation(&mut self.db, op, &mut ctx)
            };

            match outcome {
                Ok(OpOutcome::Applied { rows }) => {
                    report.applied += 1;
                    report.rows += rows;
                    if let Some(step) = journal.step_mut(index) {
                        step.processed_count = step.processed_count.max(rows);
                        step.complete();
                    }
                    if op.is_destructive() {
                        tracing::info!(revision, index, kind = op.kind(), operation = %op, "dropped");
                    } else {
                        tracing::debug!(revision, index, kind = op.kind(), operation = %op, rows, "applied");
                    }
                }
                Ok(OpOutcome::Skipped { reason }) => {
                    report.skipped += 1;
                    if let Some(step) = journal.step_mut(index) {
                        step.skip();
                    }
                    tracing::debug!(revision, index, operation = %op, reason = %reason, "skipped");
                }
                Err(source) => {
                    if transactional {
                        if let Err(e) = self.db.rollback() {
                            tracing::error!(revision, error = %e, "rollback failed");
                        }
                    }
                    if let Some(step) = journal.step_mut(index) {
                        step.fail(source.to_string());
                    }
                    if let Err(e) = self.store.save_journal(&journal) {
                        tracing::error!(revision, error = %e, "failed to journal failure");
                    }
                    tracing::error!(
                        revision,
                        %direction,
                        index,
                        operation = %op,
                        error = %source,
                        "operation failed"
                    );
                    return Err(MigrationError::MigrationFailed {
                        revision: revision.to_string(),
                        direction,
                        index,
                        operation: op.to_string(),
                        source: Box::new(source),
                    });
                }
            }

            if !transactional {
                self.store.save_journal(&journal)?;
            }
        }

        if transactional {
            self.db.commit()?;
        }

        report.duration_micros = started.elapsed().as_micros() as u64;
        let record = match direction {
            Direction::Up => Some(AppliedRecord::new(&unit)),
            Direction::Down => None,
        };
        let entry = HistoryEntry {
            revision: revision.to_string(),
            direction,
            finished_at: current_timestamp(),
            duration_micros: report.duration_micros,
            operations: report.applied as u32,
            skipped: report.skipped as u32,
        };
        self.store.commit(&next, record.as_ref(), &entry)?;
        *state = next;

        tracing::info!(
            revision,
            %direction,
            applied = report.applied,
            skipped = report.skipped,
            rows = report.rows,
            elapsed_ms = report.duration_micros / 1000,
            "revision applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{Operation, OperationSet};
    use crate::schema::{ColumnDef, ColumnType, EmbeddedDatabase, SchemaSnapshot, TableDef};
    use chrono::{DateTime, Utc};

    fn at(minute: u32) -> DateTime<Utc> {
        format!("2024-03-01T10:{:02}:00Z", minute).parse().unwrap()
    }

    fn create(name: &str) -> Operation {
        Operation::CreateTable {
            table: TableDef::new(name, "id").with_column(ColumnDef::required("id", ColumnType::Integer)),
        }
    }

    fn drop_table(name: &str) -> Operation {
        Operation::DropTable {
            table: name.to_string(),
        }
    }

    fn units() -> Vec<RevisionUnit> {
        vec![
            RevisionUnit::new("a", Vec::<String>::new(), at(0))
                .with_upgrade(OperationSet::reversible(vec![create("programs")]))
                .with_downgrade(OperationSet::reversible(vec![drop_table("programs")])),
            RevisionUnit::new("b", ["a"], at(1))
                .with_upgrade(OperationSet::reversible(vec![create("sessions")]))
                .with_downgrade(OperationSet::reversible(vec![drop_table("sessions")])),
        ]
    }

    fn migrator(config: MigrationConfig) -> (Migrator<EmbeddedDatabase>, sled::Db) {
        let sled = sled::Config::new().temporary(true).open().unwrap();
        let db = EmbeddedDatabase::open(&sled).unwrap();
        (Migrator::open(units(), db, &sled, config).unwrap(), sled)
    }

    #[test]
    fn test_upgrade_then_noop() {
        let (mut migrator, _sled) = migrator(MigrationConfig::default());
        let report = migrator.upgrade(&Target::Head).unwrap();
        assert_eq!(report.last_applied(), Some("b"));
        assert!(migrator.database().has_table("sessions"));

        let again = migrator.upgrade(&Target::Head).unwrap();
        assert!(again.is_noop());
        assert_eq!(migrator.history().unwrap().len(), 2);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let (mut migrator, _sled) = migrator(MigrationConfig::default().with_dry_run(true));
        let report = migrator.upgrade(&Target::Head).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.state, SchemaState::from_heads(["b".to_string()]));
        assert!(migrator.state().unwrap().is_base());
        assert!(!migrator.database().has_table("programs"));
    }

    #[test]
    fn test_dry_run_leaves_store_untouched() {
        let (mut migrator, _sled) = migrator(MigrationConfig::default().with_dry_run(true));
        // A rolled back apply of another revision, normally discarded.
        let leftover = RunJournal::new("b", Direction::Up, 1, true);
        migrator.store().save_journal(&leftover).unwrap();
        // Held elsewhere; a dry run neither waits for nor takes it.
        let guard = migrator.store().lock("other").unwrap();

        let report = migrator.upgrade(&Target::Head).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(migrator.store().journal().unwrap(), Some(leftover));

        let leftover = RunJournal::new("a", Direction::Up, 1, true);
        migrator.store().save_journal(&leftover).unwrap();
        let repair = migrator.repair().unwrap();
        assert!(repair.resumed.unwrap().dry_run);
        assert_eq!(migrator.store().journal().unwrap(), Some(leftover));
        assert_eq!(migrator.store().lock_record().unwrap().unwrap().owner, "other");
        assert!(migrator.state().unwrap().is_base());
        assert!(migrator.history().unwrap().is_empty());
        drop(guard);
    }

    #[test]
    fn test_apply_requires_parents() {
        let (mut migrator, _sled) = migrator(MigrationConfig::default());
        let mut state = SchemaState::base();
        assert!(matches!(
            migrator.apply("b", Direction::Up, &mut state),
            Err(MigrationError::ParentNotApplied { .. })
        ));
        migrator.apply("a", Direction::Up, &mut state).unwrap();
        assert_eq!(state, migrator.state().unwrap());
    }

    #[test]
    fn test_lock_blocks_run() {
        let (mut migrator, _sled) = migrator(MigrationConfig::default());
        let guard = migrator.store().lock("other").unwrap();
        assert!(matches!(
            migrator.upgrade(&Target::Head),
            Err(MigrationError::LockHeld { .. })
        ));
        drop(guard);
        migrator.upgrade(&Target::Head).unwrap();
    }
}
