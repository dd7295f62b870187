//! Relational engine adapter
//!
//! Owns the SQLite connection, transactions with cooperative cancellation,
//! deadlines for blocking work, and translation of raw engine errors.

mod engine;
mod errors;
mod value;

pub use engine::{list_tables, run_blocking, table_has_rows, CancelToken, StorageEngine};
pub use errors::{StorageError, StorageResult};
