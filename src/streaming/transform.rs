//! Per-row normalization applied while splitting.
//!
//! Transformers see one decoded line at a time and never buffer; a failure
//! carries only the reason, the splitter adds file and row context.

use std::fmt;

/// Column name that replaces `call_date` and `end_time` after merging.
pub const CALL_END_DATETIME: &str = "call_end_datetime";

/// Why a single row could not be transformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    pub reason: String,
}

impl TransformFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Stateless line rewriter shared across a split.
pub trait RowTransformer: Send + Sync {
    /// Rewrites the (already normalized) header line.
    fn transform_header(&self, header: &str) -> String;

    /// Rewrites one data line.
    fn transform(&self, line: &str) -> Result<String, TransformFailure>;
}

/// Merges columns `index` and `index + 1` into a single space-joined field.
#[derive(Debug, Clone)]
pub struct MergeColumns {
    index: usize,
    merged_name: String,
    expected_fields: Option<usize>,
}

impl MergeColumns {
    pub fn new(index: usize, merged_name: impl Into<String>) -> Self {
        Self {
            index,
            merged_name: merged_name.into(),
            expected_fields: None,
        }
    }

    /// Rejects rows whose input field count differs from `fields`.
    pub fn with_expected_fields(mut self, fields: usize) -> Self {
        self.expected_fields = Some(fields);
        self
    }

    /// `call_date` + `end_time` -> `call_end_datetime` over the eight-column
    /// CDR input.
    pub fn cdr() -> Self {
        Self::new(2, CALL_END_DATETIME).with_expected_fields(8)
    }

    /// Byte offset of the comma separating the two merged columns.
    fn seam(&self, line: &str) -> Option<usize> {
        line.match_indices(',').nth(self.index).map(|(pos, _)| pos)
    }
}

impl RowTransformer for MergeColumns {
    fn transform_header(&self, header: &str) -> String {
        let columns: Vec<&str> = header.split(',').collect();
        if columns.len() <= self.index + 1 {
            return header.to_string();
        }
        let mut merged: Vec<&str> = Vec::with_capacity(columns.len() - 1);
        merged.extend_from_slice(&columns[..self.index]);
        merged.push(&self.merged_name);
        merged.extend_from_slice(&columns[self.index + 2..]);
        merged.join(",")
    }

    fn transform(&self, line: &str) -> Result<String, TransformFailure> {
        if let Some(expected) = self.expected_fields {
            let actual = line.matches(',').count() + 1;
            if actual != expected {
                return Err(TransformFailure::new(format!(
                    "expected {} fields, found {}",
                    expected, actual
                )));
            }
        }

        let pos = self.seam(line).ok_or_else(|| {
            TransformFailure::new(format!(
                "missing delimiter after column {}",
                self.index + 1
            ))
        })?;

        let (left, right) = line.split_at(pos);
        let right = &right[1..];
        let mut out = String::with_capacity(line.len());
        out.push_str(left.trim_end());
        out.push(' ');
        out.push_str(right.trim_start());
        Ok(out)
    }
}
