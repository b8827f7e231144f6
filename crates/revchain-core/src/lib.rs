//! revchain core - revision graph, staged migration engine and embedded backend.
//!
//! This crate provides the migration machinery behind the `revchain` CLI.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod error;
pub mod migration;
pub mod revision;
pub mod schema;

pub use config::{ConfigError, ProjectConfig, CONFIG_FILE};
pub use error::Error;
pub use migration::{
    MigrationConfig, MigrationError, MigrationPlan, Migrator, RevisionGraph, SchemaState,
    StagePhase, StagedRefactor, StateStore, Target,
};
pub use revision::{Direction, LoadError, Operation, OperationSet, RevisionUnit};
pub use schema::{Database, DatabaseError, EmbeddedDatabase, SchemaShape, SchemaSnapshot};
