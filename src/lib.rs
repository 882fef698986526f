//! Broker statement import for a personal investment ledger.
//!
//! Statements from Interactive Brokers (flex-query XML), Quik (HTML) and
//! the open portfolio JSON exchange format are parsed into a common event
//! stream and reconciled into the SQLite ledger.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod import;
pub mod models;
pub mod statements;

pub use config::ImportSettings;
pub use error::{ImportError, ParseError};
pub use import::{LoadOutcome, StatementLoader};
pub use statements::{ReportType, Statement};
