//! Relational schema model and the live database collaborator.
//!
//! The engine never assumes a particular backend: it talks to a
//! [`Database`], and consults its [`SchemaSnapshot`] before every guarded
//! operation. [`EmbeddedDatabase`] is the sled-persisted backend used by the
//! CLI and the tests.

mod database;
mod embedded;
mod expr;
mod snapshot;
mod table;
mod types;

pub use database::{Database, DatabaseError};
pub use embedded::EmbeddedDatabase;
pub use expr::{value_text, Expr, ExprError};
pub use snapshot::{SchemaShape, SchemaSnapshot};
pub use table::{ColumnDef, ForeignKeyDef, TableDef};
pub use types::{row_key, ColumnType, Row, Value};
