//! Migration engine for revchain.
//!
//! This module provides reversible schema evolution with:
//! - A revision graph with branches, merges and deterministic ordering
//! - Guarded operations that are safe to re-run after a partial failure
//! - The six-phase staged refactor protocol for table-shape changes
//! - A persistent pointer, history, run journal and advisory lock
//!
//! # Staging phases
//!
//! | Phase | Upgrade | Downgrade |
//! |-------|---------|-----------|
//! | **EnumSync** | create or widen enum types | no-op (one-way) |
//! | **CreateStaging** | create `new_<table>` | drop `new_<table>` |
//! | **Populate** | copy rows in batches | no-op |
//! | **TableSwap** | `<table>` to `old_<table>`, `new_<table>` to `<table>` | mirrored swap |
//! | **FixForeignKeys** | retarget constraints off `old_<table>` | retarget back |
//! | **Cleanup** | drop `old_<table>` (destructive) | best-effort rebuild |
//!
//! # Example
//!
//! ```ignore
//! use revchain_core::migration::{MigrationConfig, Migrator, Target};
//!
//! let mut migrator = Migrator::open(units, database, &state_db, MigrationConfig::default())?;
//!
//! let plan = migrator.plan(Direction::Up, &Target::Head)?;
//! for warning in &plan.warnings {
//!     println!("{}", warning);
//! }
//!
//! let report = migrator.upgrade(&Target::Head)?;
//! println!("now at {}", report.state);
//! ```

mod apply;
pub mod copy;
pub mod error;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod staging;
pub mod state;
pub mod store;

// Error types
pub use error::MigrationError;

// Graph types
pub use graph::{RevisionGraph, Target};

// Plan types
pub use plan::{MigrationPlan, PlanStep};

// Staging types
pub use staging::{backup_name, staging_name, StagePhase, StagedRefactor, BACKUP_PREFIX, STAGING_PREFIX};

// State types
pub use state::{
    AppliedRecord, HistoryEntry, LockRecord, RunJournal, SchemaState, StepProgress, StepStatus,
};
pub use store::{LockGuard, StateStore};

// Copy types
pub use apply::OpOutcome;
pub use copy::{copy_rows, CopyConfig, CopyProgress};

// Executor types
pub use executor::{ApplyReport, MigrationConfig, Migrator, RepairReport, RunReport, StatusReport};
