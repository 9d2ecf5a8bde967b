use std::path::PathBuf;

use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for logs or callers.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "access_token",
    "authorization:",
    "client_secret",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message coming back from the destination.
/// If sensitive content is detected, returns the fallback instead.
pub(crate) fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Pipeline-wide error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Splitting ─────────────────────────────────────────────────────────────
    #[error("Invalid format of input file. File prefix: {prefix}, CSV header: {actual}. Expected: {expected}")]
    Schema {
        prefix: String,
        expected: String,
        actual: String,
    },

    #[error("Error transforming line: {line} of file: {}, row: {row} (source row {source_row}): {reason}", file.display())]
    Transform {
        file: PathBuf,
        /// Zero-based position of the row inside its chunk.
        row: u64,
        /// One-based data row number in the source stream.
        source_row: u64,
        line: String,
        reason: String,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ── Ingestion ─────────────────────────────────────────────────────────────
    #[error("Ingestion of {dedup_key} failed after {attempts} attempt(s): {message}")]
    Ingestion {
        dedup_key: String,
        attempts: u32,
        message: String,
    },

    #[error("{failed} of {total} chunk ingestions failed; first failure: {first}")]
    AggregateIngestion {
        failed: usize,
        total: usize,
        first: Box<PipelineError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Destination transport ─────────────────────────────────────────────────
    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Destination returned HTTP {status}: {message}")]
    Destination { status: u16, message: String },

    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Wraps an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true for failures an ingest client may retry.
    ///
    /// Rate limiting, dropped connections and 5xx responses are transient;
    /// everything else is terminal for the attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::RateLimited { .. } | PipelineError::ConnectionFailed(_) => true,
            PipelineError::Destination { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Number of ingestion attempts recorded in this error, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            PipelineError::Ingestion { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_names_prefix_and_both_headers() {
        let err = PipelineError::Schema {
            prefix: "march_calls".into(),
            expected: "a,b".into(),
            actual: "a,c".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("march_calls"));
        assert!(msg.contains("CSV header: a,c"));
        assert!(msg.contains("Expected: a,b"));
    }

    #[test]
    fn transform_error_carries_row_context() {
        let err = PipelineError::Transform {
            file: PathBuf::from("/tmp/upload_3.csv"),
            row: 41,
            source_row: 30042,
            line: "123,456".into(),
            reason: "missing delimiter".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("123,456"));
        assert!(msg.contains("/tmp/upload_3.csv"));
        assert!(msg.contains("row: 41"));
        assert!(msg.contains("source row 30042"));
    }

    #[test]
    fn transient_classification() {
        assert!(PipelineError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(PipelineError::ConnectionFailed("reset".into()).is_transient());
        assert!(PipelineError::Destination { status: 503, message: "busy".into() }.is_transient());
        assert!(!PipelineError::Destination { status: 400, message: "bad".into() }.is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
        assert!(!PipelineError::Internal("x".into()).is_transient());
    }

    #[test]
    fn attempts_only_on_ingestion_errors() {
        let err = PipelineError::Ingestion {
            dedup_key: "u_0.csv".into(),
            attempts: 4,
            message: "HTTP 503".into(),
        };
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(PipelineError::Cancelled.attempts(), None);
    }

    #[test]
    fn sanitize_replaces_sensitive_messages() {
        for pattern in SENSITIVE_PATTERNS {
            let raw = format!("denied: {}xyz", pattern);
            assert_eq!(sanitize_message(&raw, "redacted"), "redacted");
        }
        assert_eq!(sanitize_message("table not found", "redacted"), "table not found");
    }
}
