//! Error types for lstore
//!
//! Provides a unified error type for all operations. "Not found" conditions
//! are not errors: table operations report them as `false`, `None` or an
//! empty result.

use thiserror::Error;

/// Result type alias using LstoreError
pub type Result<T> = std::result::Result<T, LstoreError>;

/// Unified error type for lstore operations
#[derive(Debug, Error)]
pub enum LstoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Page Errors
    // -------------------------------------------------------------------------
    /// On-disk page state is missing or inconsistent with the directory.
    /// Fatal for the affected page set.
    #[error("Corrupt or missing page: {0}")]
    CorruptPage(String),

    #[error("Page stack {0} does not exist")]
    StackNotFound(u64),

    // -------------------------------------------------------------------------
    // Catalog / Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    // -------------------------------------------------------------------------
    // Value / Schema Errors
    // -------------------------------------------------------------------------
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for LstoreError {
    fn from(e: bincode::Error) -> Self {
        LstoreError::Serialization(e.to_string())
    }
}
