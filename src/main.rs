//! tablesmith CLI entry point
//!
//! Parses arguments, runs one command and exits non-zero on failure.
//! All logic is delegated to the CLI module.

use tablesmith::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
