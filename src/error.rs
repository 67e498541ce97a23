use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::fetcher::FetchFailure;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// No usable starting point or otherwise unusable load configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The staging store held no rows for the migration unit
    #[error("Staging store is empty for tables: {}", tables.join(", "))]
    SourceEmpty { tables: Vec<String> },

    /// A failure inside a transaction that was rolled back cleanly
    #[error("Transaction failed and was rolled back: {0}")]
    Transaction(Box<LoadError>),

    /// Rollback itself failed; `original` is the error that triggered it
    #[error("Rollback failed ({rollback}) after: {original}")]
    RollbackFailed {
        original: Box<LoadError>,
        rollback: RusqliteError,
    },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchFailure),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl LoadError {
    /// Walk to the innermost cause, unwrapping transaction wrappers.
    pub fn root_cause(&self) -> &LoadError {
        match self {
            LoadError::Transaction(inner) => inner.root_cause(),
            LoadError::RollbackFailed { original, .. } => original.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_transaction_layers() {
        let err = LoadError::Transaction(Box::new(LoadError::SourceEmpty {
            tables: vec!["patients".into()],
        }));
        assert!(matches!(err.root_cause(), LoadError::SourceEmpty { .. }));
    }

    #[test]
    fn test_rollback_failure_keeps_original_message() {
        let err = LoadError::RollbackFailed {
            original: Box::new(LoadError::Error("disk full".into())),
            rollback: RusqliteError::InvalidQuery,
        };
        let text = err.to_string();
        assert!(text.contains("disk full"));
        assert!(matches!(err.root_cause(), LoadError::Error(msg) if msg == "disk full"));
    }

    #[test]
    fn test_source_empty_lists_tables() {
        let err = LoadError::SourceEmpty {
            tables: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Staging store is empty for tables: a, b");
    }
}
