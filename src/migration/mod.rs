//! DDL Synthesizer and Migrator
//!
//! The catalog records schema versions; the migrator reconciles physical
//! tables with them asynchronously.
//!
//! # Guarantees
//!
//! - One version applies in one transaction together with its log status
//! - Versions of the same table apply strictly in order
//! - A failed or cancelled version leaves the table at its last applied
//!   definition and is reported, never retried

pub mod ddl;
mod migrator;

pub use ddl::{ApplyOutcome, MigrationError, StructuralOp};
pub use migrator::{MigrationOutcome, MigrationReport, Migrator};

use tokio::sync::mpsc;

use crate::catalog::SchemaVersion;

/// One version waiting for the migrator
#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub entry: SchemaVersion,
}

pub type MigrationSender = mpsc::UnboundedSender<MigrationJob>;
pub type MigrationReceiver = mpsc::UnboundedReceiver<MigrationJob>;
