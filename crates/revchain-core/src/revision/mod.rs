//! Revision units, their operations, and the on-disk revision format.

mod loader;
mod operation;
pub mod sql;
mod unit;

pub use loader::{
    load_dir, parse_revision, revision_file_name, write_revision, LoadError, REVISION_EXTENSION,
};
pub use operation::{ColumnMapping, Operation, OperationSet};
pub use unit::{Direction, RevisionUnit, BASE_MARKER};
