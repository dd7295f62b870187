//! CLI argument definitions using clap
//!
//! Commands:
//! - tablesmith init
//! - tablesmith tables list|show <table>
//! - tablesmith apply <file>
//! - tablesmith alter <table> <file> [--confirm] [--reject-overflow]
//! - tablesmith records list|create <table>
//! - tablesmith versions <table>
//! - tablesmith drop-project --confirm

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tablesmith - metadata-driven table provisioning
#[derive(Parser, Debug)]
#[command(name = "tablesmith")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./tablesmith.json")]
    pub config: PathBuf,

    /// Project the command operates on
    #[arg(long, global = true, default_value = "default")]
    pub project: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default config if none exists and create the metadata tables
    Init {
        /// Database file written into a new config
        #[arg(long, default_value = "./tablesmith.db")]
        database: String,
    },

    /// Inspect table definitions
    Tables {
        #[command(subcommand)]
        action: TablesAction,
    },

    /// Create a table from a JSON definition (`-` reads stdin)
    Apply { file: PathBuf },

    /// Apply field operations from a JSON array (`-` reads stdin)
    Alter {
        table: String,
        file: PathBuf,

        /// Allow narrowing and field removal
        #[arg(long)]
        confirm: bool,

        /// Fail instead of rewriting values that no longer fit
        #[arg(long, requires = "confirm")]
        reject_overflow: bool,

        /// Seconds to wait for the version to be applied
        #[arg(long, default_value_t = 60)]
        wait: u64,
    },

    /// Read and write records
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },

    /// Show a table's schema version log
    Versions { table: String },

    /// Drop the project with every table and record in it
    DropProject {
        /// Required; the drop cannot be undone
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TablesAction {
    List,
    Show { table: String },
}

#[derive(Subcommand, Debug)]
pub enum RecordsAction {
    /// List records; `--param email=eq.jean@x.com`, `--param order=name.desc`
    List {
        table: String,
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Create one record from a JSON object (`-` reads stdin)
    Create { table: String, file: PathBuf },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records_list() {
        let cli = Cli::try_parse_from([
            "tablesmith",
            "--project",
            "p1",
            "records",
            "list",
            "clients",
            "--param",
            "email=eq.jean@x.com",
        ])
        .unwrap();
        assert_eq!(cli.project, "p1");
        match cli.command {
            Command::Records {
                action: RecordsAction::List { table, params },
            } => {
                assert_eq!(table, "clients");
                assert_eq!(params, vec!["email=eq.jean@x.com".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_reject_overflow_requires_confirm() {
        assert!(Cli::try_parse_from(["tablesmith", "alter", "clients", "ops.json", "--reject-overflow"]).is_err());
    }
}
