//! Persistent migration state in sled.

use super::error::MigrationError;
use super::state::{AppliedRecord, HistoryEntry, LockRecord, RunJournal, SchemaState};
use crate::revision::Direction;
use sled::{Batch, Db, Tree};

const VERSION_KEY: &[u8] = b"version";
const JOURNAL_KEY: &[u8] = b"journal";
const LOCK_KEY: &[u8] = b"lock";
const APPLIED_PREFIX: &[u8] = b"applied:";
const HISTORY_PREFIX: &[u8] = b"history:";

/// Migration state store.
///
/// One sled tree holds the version pointers, an apply record per applied
/// revision, the history log, the run journal and the advisory lock.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    tree: Tree,
}

impl StateStore {
    /// Tree name for migration state.
    pub const TREE_NAME: &'static str = "revchain:state";

    /// Open or create the state store.
    pub fn open(db: &Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self {
            db: db.clone(),
            tree,
        })
    }

    /// Load the version pointers; base when nothing was ever applied.
    pub fn load_state(&self) -> Result<SchemaState, MigrationError> {
        match self.tree.get(VERSION_KEY)? {
            Some(bytes) => SchemaState::from_bytes(&bytes),
            None => Ok(SchemaState::base()),
        }
    }

    /// Overwrite the version pointers.
    pub fn save_state(&self, state: &SchemaState) -> Result<(), MigrationError> {
        self.tree.insert(VERSION_KEY, state.to_bytes()?)?;
        Ok(())
    }

    /// Apply record of a revision.
    pub fn applied(&self, revision: &str) -> Result<Option<AppliedRecord>, MigrationError> {
        match self.tree.get(Self::applied_key(revision))? {
            Some(bytes) => Ok(Some(AppliedRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All apply records, by revision id.
    pub fn applied_records(&self) -> Result<Vec<AppliedRecord>, MigrationError> {
        self.tree
            .scan_prefix(APPLIED_PREFIX)
            .map(|entry| {
                let (_, value) = entry?;
                AppliedRecord::from_bytes(&value)
            })
            .collect()
    }

    /// Persist the outcome of one apply atomically.
    ///
    /// Writes the new pointers, adds or removes the apply record, appends
    /// to the history and clears the journal in a single batch.
    pub fn commit(
        &self,
        state: &SchemaState,
        applied: Option<&AppliedRecord>,
        entry: &HistoryEntry,
    ) -> Result<(), MigrationError> {
        let mut batch = Batch::default();
        batch.insert(VERSION_KEY, state.to_bytes()?);
        match (entry.direction, applied) {
            (Direction::Up, Some(record)) => {
                batch.insert(Self::applied_key(&record.revision), record.to_bytes()?)
            }
            (Direction::Up, None) => {
                return Err(MigrationError::StateCorrupted {
                    message: format!("upgrade of '{}' committed without a record", entry.revision),
                })
            }
            (Direction::Down, _) => batch.remove(Self::applied_key(&entry.revision)),
        }
        batch.insert(self.history_key()?, entry.to_bytes()?);
        batch.remove(JOURNAL_KEY);

        self.tree.apply_batch(batch)?;
        self.flush()
    }

    /// History entries, oldest first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        self.tree
            .scan_prefix(HISTORY_PREFIX)
            .map(|entry| {
                let (_, value) = entry?;
                HistoryEntry::from_bytes(&value)
            })
            .collect()
    }

    /// The journal of an interrupted or running apply.
    pub fn journal(&self) -> Result<Option<RunJournal>, MigrationError> {
        match self.tree.get(JOURNAL_KEY)? {
            Some(bytes) => Ok(Some(RunJournal::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the journal through to disk.
    pub fn save_journal(&self, journal: &RunJournal) -> Result<(), MigrationError> {
        self.tree.insert(JOURNAL_KEY, journal.to_bytes()?)?;
        self.flush()
    }

    /// Remove the journal.
    pub fn clear_journal(&self) -> Result<(), MigrationError> {
        self.tree.remove(JOURNAL_KEY)?;
        self.flush()
    }

    /// Take the advisory lock, failing if another run holds it.
    pub fn lock(&self, owner: impl Into<String>) -> Result<LockGuard, MigrationError> {
        let bytes = LockRecord::new(owner).to_bytes()?;
        match self
            .tree
            .compare_and_swap(LOCK_KEY, None as Option<&[u8]>, Some(bytes.clone()))?
        {
            Ok(()) => {
                self.flush()?;
                Ok(LockGuard {
                    tree: self.tree.clone(),
                    bytes,
                })
            }
            Err(conflict) => {
                let holder = match conflict.current {
                    Some(current) => LockRecord::from_bytes(&current)?,
                    None => {
                        return Err(MigrationError::StateCorrupted {
                            message: "lock changed while being taken".to_string(),
                        })
                    }
                };
                Err(MigrationError::LockHeld {
                    owner: format!("{} (pid {})", holder.owner, holder.pid),
                    acquired_at: holder.acquired_at,
                })
            }
        }
    }

    /// Current lock holder.
    pub fn lock_record(&self) -> Result<Option<LockRecord>, MigrationError> {
        match self.tree.get(LOCK_KEY)? {
            Some(bytes) => Ok(Some(LockRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Release the lock regardless of holder, returning the released record.
    pub fn force_unlock(&self) -> Result<Option<LockRecord>, MigrationError> {
        let previous = self.lock_record()?;
        self.tree.remove(LOCK_KEY)?;
        self.flush()?;
        Ok(previous)
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.tree.flush()?;
        Ok(())
    }

    fn applied_key(revision: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(APPLIED_PREFIX.len() + revision.len());
        key.extend_from_slice(APPLIED_PREFIX);
        key.extend_from_slice(revision.as_bytes());
        key
    }

    fn history_key(&self) -> Result<Vec<u8>, MigrationError> {
        let sequence = self.db.generate_id()?;
        let mut key = Vec::with_capacity(HISTORY_PREFIX.len() + 8);
        key.extend_from_slice(HISTORY_PREFIX);
        key.extend_from_slice(&sequence.to_be_bytes());
        Ok(key)
    }
}

/// Holds the advisory lock until dropped.
pub struct LockGuard {
    tree: Tree,
    bytes: Vec<u8>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let released = self
            .tree
            .compare_and_swap(LOCK_KEY, Some(self.bytes.as_slice()), None as Option<&[u8]>);
        match released {
            Ok(Ok(())) => {
                let _ = self.tree.flush();
            }
            Ok(Err(_)) => tracing::warn!("migration lock was replaced while held"),
            Err(e) => tracing::error!(error = %e, "failed to release migration lock"),
        }
    }
}
