//! Migration state records.
//!
//! Everything here is persisted by the [`StateStore`](super::StateStore) as
//! rkyv archives: the schema version pointers, per-revision apply records,
//! the history log, the journal of an in-flight revision and the lock.

use super::error::MigrationError;
use super::graph::RevisionGraph;
use crate::error::current_timestamp;
use crate::revision::{Direction, RevisionUnit};
use crate::schema::ForeignKeyDef;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

macro_rules! impl_record_bytes {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Serialize the record to bytes.
                pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
                    rkyv::to_bytes::<rkyv::rancor::Error>(self)
                        .map(|v| v.to_vec())
                        .map_err(|e| MigrationError::Serialization(e.to_string()))
                }

                /// Deserialize a record from bytes.
                pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
                    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                        .map_err(|e| MigrationError::Deserialization(e.to_string()))
                }
            }
        )*
    };
}

/// The schema's current revision pointers.
///
/// Empty at base, a single id normally, and two or more ids while branches
/// wait for a merge. Every applied revision is an ancestor of a pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct SchemaState {
    heads: Vec<String>,
}

impl SchemaState {
    /// State with nothing applied.
    pub fn base() -> Self {
        Self::default()
    }

    /// State pointing at the given revisions.
    pub fn from_heads(heads: impl IntoIterator<Item = String>) -> Self {
        let mut heads: Vec<String> = heads.into_iter().collect();
        heads.sort();
        heads.dedup();
        Self { heads }
    }

    /// Current pointers, sorted.
    pub fn heads(&self) -> &[String] {
        &self.heads
    }

    /// Whether nothing is applied.
    pub fn is_base(&self) -> bool {
        self.heads.is_empty()
    }

    /// Move the pointers across one applied or reverted revision.
    ///
    /// Upgrading replaces the revision's parents with the revision.
    /// Downgrading replaces the revision with those parents that are not
    /// already below another pointer.
    pub fn record(
        &mut self,
        graph: &RevisionGraph,
        unit: &RevisionUnit,
        direction: Direction,
    ) -> Result<(), MigrationError> {
        match direction {
            Direction::Up => {
                self.heads.retain(|h| !unit.parents.contains(h));
                self.heads.push(unit.id.clone());
            }
            Direction::Down => {
                self.heads.retain(|h| h != &unit.id);
                let below = graph.ancestors(self.heads.iter().map(String::as_str))?;
                for parent in &unit.parents {
                    if !below.contains(parent) {
                        self.heads.push(parent.clone());
                    }
                }
            }
        }
        self.heads.sort();
        self.heads.dedup();
        Ok(())
    }
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.heads.is_empty() {
            write!(f, "base")
        } else {
            write!(f, "{}", self.heads.join(", "))
        }
    }
}

/// Record of an applied revision.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct AppliedRecord {
    /// Revision id.
    pub revision: String,
    /// Content checksum at apply time.
    pub checksum: String,
    /// When it was applied (microseconds since epoch).
    pub applied_at: u64,
}

impl AppliedRecord {
    /// Record a revision applied now.
    pub fn new(unit: &RevisionUnit) -> Self {
        Self {
            revision: unit.id.clone(),
            checksum: unit.checksum(),
            applied_at: current_timestamp(),
        }
    }
}

/// One completed apply in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Revision id.
    pub revision: String,
    /// Direction applied.
    pub direction: Direction,
    /// When it finished (microseconds since epoch).
    pub finished_at: u64,
    /// Wall time spent (microseconds).
    pub duration_micros: u64,
    /// Operations executed.
    pub operations: u32,
    /// Operations skipped because their effect was already present.
    pub skipped: u32,
}

/// Status of a single operation within a journalled apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Started and not finished.
    InProgress,
    /// Completed.
    Complete,
    /// Already in effect; nothing done.
    Skipped,
    /// Failed.
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Complete => write!(f, "complete"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct StepProgress {
    /// Index of the operation in its set.
    pub index: usize,
    /// Current status.
    pub status: StepStatus,
    /// When the operation started (microseconds since epoch).
    pub started_at: Option<u64>,
    /// When the operation finished (microseconds since epoch).
    pub completed_at: Option<u64>,
    /// Rows processed so far.
    pub processed_count: u64,
    /// Key of the last row copied, for resuming a batched copy.
    pub last_key: Option<String>,
    /// Foreign keys being moved when the operation was interrupted.
    pub pending_foreign_keys: Vec<ForeignKeyDef>,
    /// Error message if the operation failed.
    pub error: Option<String>,
}

impl StepProgress {
    /// Create a pending step.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            processed_count: 0,
            last_key: None,
            pending_foreign_keys: Vec::new(),
            error: None,
        }
    }

    /// Mark the step as started.
    pub fn start(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(current_timestamp());
        self.error = None;
    }

    /// Mark the step as completed.
    pub fn complete(&mut self) {
        self.status = StepStatus::Complete;
        self.completed_at = Some(current_timestamp());
        self.pending_foreign_keys.clear();
    }

    /// Mark the step as skipped.
    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(current_timestamp());
        self.pending_foreign_keys.clear();
    }

    /// Mark the step as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(current_timestamp());
        self.error = Some(error.into());
    }
}

/// Journal of the revision currently being applied.
///
/// Written before the first operation runs and removed in the same batch
/// that advances the version pointers, so its presence means a run stopped
/// part way through `revision`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct RunJournal {
    /// Revision being applied.
    pub revision: String,
    /// Direction being applied.
    pub direction: Direction,
    /// When the apply started (microseconds since epoch).
    pub started_at: u64,
    /// When the journal was last written (microseconds since epoch).
    pub updated_at: u64,
    /// Whether the operations ran inside a backend transaction.
    pub transactional: bool,
    /// Per-operation progress.
    pub steps: Vec<StepProgress>,
}

impl RunJournal {
    /// Start a journal for a revision with `operations` operations.
    pub fn new(
        revision: impl Into<String>,
        direction: Direction,
        operations: usize,
        transactional: bool,
    ) -> Self {
        let now = current_timestamp();
        Self {
            revision: revision.into(),
            direction,
            started_at: now,
            updated_at: now,
            transactional,
            steps: (0..operations).map(StepProgress::new).collect(),
        }
    }

    /// Whether this journal belongs to the given apply.
    pub fn matches(&self, revision: &str, direction: Direction) -> bool {
        self.revision == revision && self.direction == direction
    }

    /// Progress of one operation.
    pub fn step(&self, index: usize) -> Option<&StepProgress> {
        self.steps.get(index)
    }

    /// Progress of one operation (mutable).
    pub fn step_mut(&mut self, index: usize) -> Option<&mut StepProgress> {
        self.updated_at = current_timestamp();
        self.steps.get_mut(index)
    }

    /// The failed step, if any.
    pub fn failed_step(&self) -> Option<&StepProgress> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// Number of steps completed or skipped.
    pub fn finished_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Complete | StepStatus::Skipped))
            .count()
    }
}

/// Holder of the advisory migration lock.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct LockRecord {
    /// Who holds the lock.
    pub owner: String,
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was taken (microseconds since epoch).
    pub acquired_at: u64,
}

impl LockRecord {
    /// A lock taken now by this process.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            pid: std::process::id(),
            acquired_at: current_timestamp(),
        }
    }
}

impl_record_bytes!(SchemaState, AppliedRecord, HistoryEntry, RunJournal, LockRecord);

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, parents: &[&str], minute: u32) -> RevisionUnit {
        let at = format!("2024-03-01T10:{:02}:00Z", minute);
        RevisionUnit::new(id, parents.iter().copied(), at.parse().unwrap())
    }

    fn graph() -> RevisionGraph {
        RevisionGraph::new(vec![
            unit("a", &[], 0),
            unit("b", &["a"], 1),
            unit("d", &["a"], 2),
            unit("c", &["b", "d"], 3),
        ])
        .unwrap()
    }

    #[test]
    fn test_pointer_walk_through_merge() {
        let graph = graph();
        let mut state = SchemaState::base();
        for id in ["a", "b", "d", "c"] {
            let unit = graph.require(id).unwrap().clone();
            state.record(&graph, &unit, Direction::Up).unwrap();
        }
        assert_eq!(state.heads(), &["c".to_string()]);

        let c = graph.require("c").unwrap().clone();
        state.record(&graph, &c, Direction::Down).unwrap();
        assert_eq!(state.heads(), &["b".to_string(), "d".to_string()]);

        let d = graph.require("d").unwrap().clone();
        state.record(&graph, &d, Direction::Down).unwrap();
        assert_eq!(state.heads(), &["b".to_string()]);

        let b = graph.require("b").unwrap().clone();
        state.record(&graph, &b, Direction::Down).unwrap();
        assert_eq!(state.heads(), &["a".to_string()]);

        let a = graph.require("a").unwrap().clone();
        state.record(&graph, &a, Direction::Down).unwrap();
        assert!(state.is_base());
        assert_eq!(state.to_string(), "base");
    }

    #[test]
    fn test_state_bytes() {
        let state = SchemaState::from_heads(["d".to_string(), "b".to_string()]);
        let decoded = SchemaState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.to_string(), "b, d");
    }

    #[test]
    fn test_journal_progress() {
        let mut journal = RunJournal::new("movements_populate", Direction::Up, 2, false);
        assert!(journal.matches("movements_populate", Direction::Up));
        assert!(!journal.matches("movements_populate", Direction::Down));

        if let Some(step) = journal.step_mut(0) {
            step.start();
            step.complete();
        }
        if let Some(step) = journal.step_mut(1) {
            step.start();
            step.last_key = Some("00000000000000000042".to_string());
            step.fail("disk full");
        }
        assert_eq!(journal.finished_steps(), 1);
        assert_eq!(journal.failed_step().map(|s| s.index), Some(1));

        let decoded = RunJournal::from_bytes(&journal.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, journal);
    }
}
