//! Header checks performed before any chunk exists.

use crate::error::PipelineError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Header every CDR upload must carry.
pub const CDR_INPUT_HEADER: &str =
    "caller_id,recipient,call_date,end_time,duration,cost,reference,currency";

/// Header written to chunks once date and time are merged.
pub const CDR_OUTPUT_HEADER: &str =
    "caller_id,recipient,call_end_datetime,duration,cost,reference,currency";

/// Trims every column and re-joins them with commas.
pub fn normalize_header(header: &str) -> String {
    header
        .split(',')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(",")
}

/// Compares a normalized header against a fixed column list.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    expected: String,
}

impl SchemaValidator {
    pub fn new(expected: impl AsRef<str>) -> Self {
        Self {
            expected: normalize_header(expected.as_ref()),
        }
    }

    pub fn cdr() -> Self {
        Self::new(CDR_INPUT_HEADER)
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Checks an already normalized header; `prefix` only feeds the error.
    pub fn check(&self, prefix: &str, normalized: &str) -> Result<(), PipelineError> {
        if normalized == self.expected {
            Ok(())
        } else {
            Err(PipelineError::Schema {
                prefix: prefix.to_string(),
                expected: self.expected.clone(),
                actual: normalized.to_string(),
            })
        }
    }
}
