//! Migration-specific error types.

use crate::revision::{Direction, LoadError};
use crate::schema::DatabaseError;
use thiserror::Error;

/// Migration-specific errors.
///
/// Graph errors are reported before anything runs. Every error halts the
/// run; [`MigrationError::RunHalted`] wraps failures of a multi-revision run
/// with the last revision that was applied.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The parent graph is not acyclic.
    #[error("revision graph has a cycle through {revisions:?}")]
    Cycle {
        /// Revisions left unordered.
        revisions: Vec<String>,
    },

    /// More than one revision has no children and no explicit target was given.
    #[error("multiple heads {heads:?}; name a revision or use 'heads'")]
    AmbiguousHead {
        /// The competing heads.
        heads: Vec<String>,
    },

    /// Two revisions share an id.
    #[error("duplicate revision id '{0}'")]
    DuplicateRevision(String),

    /// No revision has this id.
    #[error("unknown revision '{0}'")]
    UnknownRevision(String),

    /// A revision names a parent that does not exist.
    #[error("revision '{revision}' names missing parent '{parent}'")]
    MissingParent {
        /// The revision.
        revision: String,
        /// The missing parent id.
        parent: String,
    },

    /// A revision was applied before one of its parents.
    #[error("cannot upgrade '{revision}': parent '{parent}' is not applied")]
    ParentNotApplied {
        /// The revision.
        revision: String,
        /// The unapplied parent.
        parent: String,
    },

    /// A revision was reverted while a child is still applied.
    #[error("cannot downgrade '{revision}': child '{child}' is still applied")]
    ChildApplied {
        /// The revision.
        revision: String,
        /// The applied child.
        child: String,
    },

    /// One operation of one revision failed.
    #[error("{direction} of revision '{revision}' failed at operation {index} ({operation}): {source}")]
    MigrationFailed {
        /// The revision being applied.
        revision: String,
        /// Direction being applied.
        direction: Direction,
        /// Position of the failing operation in its set.
        index: usize,
        /// Description of the failing operation.
        operation: String,
        /// Underlying failure.
        source: Box<MigrationError>,
    },

    /// A one-way downgrade was refused.
    #[error("downgrade of '{revision}' is one-way: {reason}")]
    IrreversibleStep {
        /// The revision.
        revision: String,
        /// Why the step is one-way.
        reason: String,
    },

    /// A table still referenced by foreign keys was about to be retired.
    #[error("table '{table}' is still referenced by {constraints:?}")]
    ReferentialIntegrity {
        /// The table.
        table: String,
        /// Constraints referencing it.
        constraints: Vec<String>,
    },

    /// Staging phases of one refactor would run out of order.
    #[error("refactor '{refactor}': {message}")]
    PhaseOrder {
        /// The refactor tag.
        refactor: String,
        /// What is out of order.
        message: String,
    },

    /// A destructive forward set without explicit permission.
    #[error("revision '{revision}' is destructive ({reason}); set allow_destructive to proceed")]
    UnsafeOperation {
        /// The revision.
        revision: String,
        /// The one-way reason.
        reason: String,
    },

    /// Another run holds the advisory lock.
    #[error("migration lock held by {owner} since {acquired_at}")]
    LockHeld {
        /// Lock owner description.
        owner: String,
        /// When the lock was taken (microseconds since epoch).
        acquired_at: u64,
    },

    /// An applied revision's content no longer matches what was applied.
    #[error("revision '{revision}' was modified after it was applied (checksum {recorded}, now {current})")]
    RevisionModified {
        /// The revision.
        revision: String,
        /// Checksum recorded at apply time.
        recorded: String,
        /// Checksum of the revision as loaded.
        current: String,
    },

    /// A previous run stopped part way through a different revision.
    #[error("interrupted {direction} of '{revision}' must be repaired first")]
    InterruptedRun {
        /// The journalled revision.
        revision: String,
        /// The journalled direction.
        direction: Direction,
    },

    /// A downgrade target that is not applied.
    #[error("cannot downgrade to '{0}': it is not applied")]
    TargetNotApplied(String),

    /// Persisted migration state is inconsistent.
    #[error("migration state corrupted: {message}")]
    StateCorrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A multi-revision run stopped.
    #[error("run halted (last applied: {}): {source}", .last_applied.as_deref().unwrap_or("base"))]
    RunHalted {
        /// Last revision successfully applied, if any.
        last_applied: Option<String>,
        /// Why the run stopped.
        source: Box<MigrationError>,
    },

    /// Backend error.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Revision file error.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// The innermost error behind run and operation wrappers.
    pub fn root(&self) -> &MigrationError {
        match self {
            MigrationError::RunHalted { source, .. }
            | MigrationError::MigrationFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<sled::Error> for MigrationError {
    fn from(e: sled::Error) -> Self {
        MigrationError::Storage(crate::error::Error::Storage(e))
    }
}
