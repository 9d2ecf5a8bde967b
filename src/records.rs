//! Typed call-detail records as they look after the date/time merge.

use std::io::Read;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Timestamp layouts accepted for `call_end_datetime`, tried in order.
const CALL_END_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// One row of the `CallDetails` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDetail {
    pub caller_id: Option<i64>,
    pub recipient: Option<i64>,
    pub call_end_datetime: Option<String>,
    /// Call duration in seconds.
    pub duration: Option<u32>,
    pub cost: Option<f64>,
    pub reference: String,
    pub currency: Option<String>,
}

impl CallDetail {
    /// Parses `call_end_datetime`, accepting the upload layout
    /// (`16/08/2016 14:21:33`) as well as ISO 8601 / RFC 3339.
    pub fn call_end(&self) -> Option<NaiveDateTime> {
        let raw = self.call_end_datetime.as_deref()?.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.naive_utc());
        }
        CALL_END_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    }
}

/// Reads every record from a post-transform CSV (header first).
pub fn read_call_details<R: Read>(reader: R) -> Result<Vec<CallDetail>, PipelineError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    csv.deserialize()
        .collect::<Result<Vec<CallDetail>, csv::Error>>()
        .map_err(|e| PipelineError::io("parsing call details", e.into()))
}
