//! Error types for SampleGraph.
//!
//! Library crates use [`SampleGraphError`] via `thiserror`; the catalog client
//! reports per-call outcomes with [`ApiError`] so the crawl loop can tell a
//! controlled stop from a retryable or permanent failure.
//! The CLI wraps these with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all SampleGraph operations.
#[derive(Debug, thiserror::Error)]
pub enum SampleGraphError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside the budgeted catalog client.
    #[error("network error: {0}")]
    Network(String),

    /// Catalog API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Metadata index (libSQL) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON encoding/decoding of persisted state.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Checkpoint counters disagree with the stored topology.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(#[from] CheckpointMismatch),

    /// Upload/download/list against the backup store failed.
    #[error("backup transport failure: {0}")]
    BackupTransport(String),

    /// Checkpoint archive could not be packed or unpacked.
    #[error("archive error: {0}")]
    Archive(String),

    /// Milestone validation job exited nonzero.
    #[error("milestone {milestone} validation failed with exit code {exit_code}")]
    ValidationFailure { milestone: u64, exit_code: i32 },

    /// A post-processing task could not be scheduled or joined.
    #[error("post-processing error: {0}")]
    PostProcess(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SampleGraphError>;

impl SampleGraphError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the wrapped API error is the budget stop signal.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::Api(ApiError::BudgetExhausted { .. }))
    }
}

impl From<serde_json::Error> for SampleGraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// Outcome of a failed catalog API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The per-run request ceiling was reached. Not a failure: the crawl
    /// loop treats this as the signal to stop and checkpoint.
    #[error("request budget exhausted after {requests_made} calls")]
    BudgetExhausted { requests_made: u32 },

    /// Network error, HTTP 429 or 5xx that persisted through every retry.
    #[error("transient failure on {endpoint} after {attempts} attempt(s): {message}")]
    Transient {
        endpoint: String,
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    /// HTTP 4xx other than 429. Never retried.
    #[error("permanent failure on {endpoint} (HTTP {status}): {message}")]
    Permanent {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The response body was not the expected JSON shape.
    #[error("could not decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl ApiError {
    /// True for the source confirming the item no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Permanent { status: 404, .. })
    }
}

// ---------------------------------------------------------------------------
// CheckpointMismatch
// ---------------------------------------------------------------------------

/// Discrepancy between recorded checkpoint counters and the actual state.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error(
    "nodes {recorded_nodes} recorded vs {actual_nodes} actual, \
     edges {recorded_edges} vs {actual_edges}, \
     processed {recorded_processed} vs {actual_processed}, \
     pending {recorded_pending} vs {actual_pending}, \
     {unprocessed_nodes} node(s) missing from the processed set"
)]
pub struct CheckpointMismatch {
    pub recorded_nodes: usize,
    pub actual_nodes: usize,
    pub recorded_edges: usize,
    pub actual_edges: usize,
    pub recorded_processed: usize,
    pub actual_processed: usize,
    pub recorded_pending: usize,
    pub actual_pending: usize,
    pub unprocessed_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SampleGraphError::config("max_requests exceeds the daily cap");
        assert_eq!(err.to_string(), "config error: max_requests exceeds the daily cap");

        let err = SampleGraphError::validation("schema_version 99 not supported");
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[test]
    fn budget_exhaustion_is_recognised_through_wrapper() {
        let err: SampleGraphError = ApiError::BudgetExhausted { requests_made: 10 }.into();
        assert!(err.is_budget_exhausted());
        assert!(err.to_string().contains("10 calls"));
    }

    #[test]
    fn not_found_is_permanent_404_only() {
        let gone = ApiError::Permanent {
            endpoint: "sounds/1/".into(),
            status: 404,
            message: "Not found".into(),
        };
        assert!(gone.is_not_found());

        let forbidden = ApiError::Permanent {
            endpoint: "sounds/1/".into(),
            status: 403,
            message: "Forbidden".into(),
        };
        assert!(!forbidden.is_not_found());
    }
}
