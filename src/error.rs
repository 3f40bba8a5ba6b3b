//! Error types for nodefeed
//!
//! Provides structured error types for the source ledger, feed ingestion,
//! the node registry and the storage backends.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for nodefeed
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("Invalid CIDR {value:?}: {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("Invalid period {value:?}: {reason}")]
    InvalidPeriod { value: String, reason: String },

    #[error("Invalid URL {value:?}: {reason}")]
    InvalidUrl { value: String, reason: String },

    #[error("Invalid cursor {value:?}")]
    InvalidCursor { value: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Lookup / Conflict Errors
    // =========================================================================
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Source {source_id} is not eligible for execution")]
    ExecutionNotEligible { source_id: i64 },

    #[error("Observation already recorded: {address} for source {source_id} at version {version}")]
    DuplicateObservation {
        address: String,
        source_id: i64,
        version: i64,
    },

    // =========================================================================
    // Feed Errors
    // =========================================================================
    #[error("Feed fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Feed {url} answered with HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("Feed {url} timed out after {timeout:?}")]
    FetchTimeout { url: String, timeout: Duration },

    #[error("Feed decode error: {0}")]
    Decode(#[from] csv::Error),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a caller should do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff (bounded by the retry policy)
    RetryWithBackoff,
    /// Record the failure against the offending row and keep going
    SkipRow,
    /// Give up on this operation; surface the error
    Abort,
}

impl Error {
    /// Build a `NotFound` error
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Build an `AlreadyExists` error
    pub fn already_exists(kind: &str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Fetch(_)
            | Error::FetchTimeout { .. }
            | Error::Storage(_)
            | Error::Io(_) => ErrorAction::RetryWithBackoff,

            // Upstream 5xx and throttling are worth another attempt, 4xx are not
            Error::FetchStatus { status, .. } => {
                if *status >= 500 || *status == 429 {
                    ErrorAction::RetryWithBackoff
                } else {
                    ErrorAction::Abort
                }
            }

            // Per-row failures never abort a batch
            Error::InvalidAddress { .. } | Error::DuplicateObservation { .. } => {
                ErrorAction::SkipRow
            }

            _ => ErrorAction::Abort,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Fetch(_) | Error::FetchTimeout { .. } | Error::Storage(_) | Error::Io(_)
        )
    }

    /// Check if this error was caused by caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress { .. }
                | Error::InvalidCidr { .. }
                | Error::InvalidPeriod { .. }
                | Error::InvalidUrl { .. }
                | Error::InvalidCursor { .. }
                | Error::Validation(_)
        )
    }

    /// HTTP status code equivalent of this error
    pub fn status_code(&self) -> u16 {
        match self {
            e if e.is_validation() => 400,
            Error::NotFound { .. } => 404,
            Error::AlreadyExists { .. }
            | Error::ExecutionNotEligible { .. }
            | Error::DuplicateObservation { .. } => 409,
            Error::Fetch(_) | Error::FetchStatus { .. } | Error::FetchTimeout { .. } => 502,
            _ => 500,
        }
    }

    /// Short machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            e if e.is_validation() => "validation_error",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::ExecutionNotEligible { .. } | Error::DuplicateObservation { .. } => "conflict",
            Error::Fetch(_) | Error::FetchStatus { .. } | Error::FetchTimeout { .. } => {
                "upstream_error"
            }
            _ => "internal_error",
        }
    }
}

/// Result type alias for nodefeed
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::FetchStatus {
            url: "http://feed.local/list.csv".into(),
            status: 503,
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

        let err = Error::FetchStatus {
            url: "http://feed.local/list.csv".into(),
            status: 404,
        };
        assert_eq!(err.action(), ErrorAction::Abort);

        let err = Error::InvalidAddress {
            value: "bad-addr".into(),
            reason: "not an IP literal".into(),
        };
        assert_eq!(err.action(), ErrorAction::SkipRow);

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::Abort);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Storage("connection reset".into());
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let invalid = Error::InvalidPeriod {
            value: "soon".into(),
            reason: "unknown unit".into(),
        };
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_transient());
        assert!(invalid.is_validation());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::not_found("Source", 7).status_code(), 404);
        assert_eq!(Error::already_exists("Source", "spamhaus").status_code(), 409);
        assert_eq!(Error::InvalidCursor { value: "x".into() }.status_code(), 400);
        assert_eq!(Error::Internal("boom".into()).status_code(), 500);
        assert_eq!(Error::not_found("Allowlist", 3).to_string(), "Allowlist not found: 3");
    }
}
