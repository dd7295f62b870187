//! CLI module for tablesmith
//!
//! Provides command-line access to one project of the configured database:
//! - init: write a config and create the metadata tables
//! - tables / versions: inspect definitions and the version log
//! - apply / alter: author schemas
//! - records: list and create records
//! - drop-project: delete the project's namespace

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, RecordsAction, TablesAction};
pub use commands::{execute, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_document, write_error, write_response};
