//! Error types of the statement importer

use thiserror::Error;

/// Failure while reading a statement file into events.
///
/// Any of these aborts the whole file before a single row is written.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed XML: {0}")]
    Xml(String),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown text encoding: {0}")]
    Encoding(String),

    #[error("Unsupported report type: {0}")]
    UnsupportedReport(String),

    #[error("Mandatory section is missing: {0}")]
    MissingSection(String),

    #[error("Unsupported version of open portfolio format: {0}")]
    UnsupportedVersion(String),

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Invalid {field} value '{value}'")]
    InvalidValue { field: String, value: String },

    #[error("{0}")]
    Structure(String),
}

impl ParseError {
    pub fn invalid(field: &str, value: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

/// Failure while writing one event into the ledger.
///
/// Returned by the per-event handlers; it stops the current statement.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Account not found: {number} ({currency})")]
    AccountNotFound { number: String, currency: String },

    #[error("Asset creation cancelled for '{0}'")]
    AssetCreationCancelled(String),

    #[error("Asset type {0} is not supported")]
    UnsupportedAssetClass(String),

    #[error("Load of {0} is not implemented")]
    Unsupported(String),

    #[error("Corporate action type is not supported: {0}")]
    UnsupportedCorporateAction(String),

    #[error("Can't find paired record for {kind} corp.action #{number}")]
    MissingPairedRecord { kind: String, number: String },

    #[error("Failed to parse {0}")]
    Pattern(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;
