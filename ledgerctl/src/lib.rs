//! AuraPay ledger operator tool.
//!
//! Thin command-line front over [`aurapay_ledger::LedgerService`]. Results are
//! printed as JSON on stdout; logs go to stderr.

pub mod cli;

pub use cli::{error_json, execute, Cli, Command};
