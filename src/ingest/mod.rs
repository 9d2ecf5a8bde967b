//! Parallel, deduplicated chunk ingestion.
//!
//! The coordinator turns sealed chunks into [`IngestionTask`]s and pushes
//! them to an [`IngestClient`] with bounded concurrency. Each task carries
//! the chunk's file name as its dedup key, so re-dispatching the same
//! chunks is a no-op at the destination and delivery stays at-least-once.

pub mod client;
pub mod coordinator;
pub mod memory;
pub mod rest;
pub mod scheduler;

use serde::{Deserialize, Serialize};

use crate::streaming::Chunk;

pub use client::{ChunkSource, IngestClient};
pub use coordinator::IngestionCoordinator;
pub use memory::MemoryStore;
pub use rest::RestIngestClient;
pub use scheduler::{IngestPermit, IngestScheduler};

/// What happens to sibling chunks once one chunk fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop starting new chunks and return the first failure.
    #[default]
    FailFast,
    /// Attempt every chunk and report all failures together.
    BestEffort,
}

/// Dedup key for a chunk: its artifact file name.
pub fn dedup_key_for(chunk: &Chunk) -> String {
    chunk.file_name()
}

/// One chunk bound for one destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionTask {
    pub chunk: Chunk,
    pub dedup_key: String,
    pub destination_table: String,
    pub compress: bool,
}

impl IngestionTask {
    pub fn new(chunk: Chunk, destination_table: impl Into<String>, compress: bool) -> Self {
        Self {
            dedup_key: dedup_key_for(&chunk),
            chunk,
            destination_table: destination_table.into(),
            compress,
        }
    }
}

/// Returned by a client once a chunk is durably accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReceipt {
    pub attempts: u32,
    /// The destination already held data under this dedup key.
    pub deduplicated: bool,
}

/// Final state of one task. Skipped tasks report zero attempts.
#[derive(Debug, Clone)]
pub struct IngestionOutcome {
    pub task: IngestionTask,
    pub succeeded: bool,
    pub attempts: u32,
    pub deduplicated: bool,
    pub last_error: Option<String>,
}

impl IngestionOutcome {
    pub(crate) fn success(task: IngestionTask, receipt: IngestReceipt) -> Self {
        Self {
            task,
            succeeded: true,
            attempts: receipt.attempts,
            deduplicated: receipt.deduplicated,
            last_error: None,
        }
    }

    pub(crate) fn failure(task: IngestionTask, attempts: u32, error: &str) -> Self {
        Self {
            task,
            succeeded: false,
            attempts,
            deduplicated: false,
            last_error: Some(error.to_string()),
        }
    }

    pub(crate) fn skipped(task: IngestionTask) -> Self {
        Self {
            task,
            succeeded: false,
            attempts: 0,
            deduplicated: false,
            last_error: None,
        }
    }

    pub fn was_skipped(&self) -> bool {
        !self.succeeded && self.attempts == 0 && self.last_error.is_none()
    }
}

/// Outcomes of a dispatch in which every chunk was ingested, ordered by
/// chunk sequence.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<IngestionOutcome>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Chunks the destination already held.
    pub fn deduplicated(&self) -> usize {
        self.outcomes.iter().filter(|o| o.deduplicated).count()
    }

    /// Sum of attempts over all chunks.
    pub fn attempts(&self) -> u32 {
        self.outcomes.iter().map(|o| o.attempts).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn chunk(seq: u32) -> Chunk {
        Chunk {
            sequence: seq,
            path: PathBuf::from(format!("/tmp/out/march_{}.csv", seq)),
            row_count: 1,
            byte_size: 10,
            header: "a".into(),
        }
    }

    #[test]
    fn dedup_key_is_file_name_and_stable() {
        let a = IngestionTask::new(chunk(0), "CallDetails", true);
        let again = IngestionTask::new(chunk(0), "CallDetails", false);
        let b = IngestionTask::new(chunk(1), "CallDetails", true);
        assert_eq!(a.dedup_key, "march_0.csv");
        assert_eq!(a.dedup_key, again.dedup_key);
        assert_ne!(a.dedup_key, b.dedup_key);
    }

    #[test]
    fn skipped_outcome_has_zero_attempts() {
        let outcome = IngestionOutcome::skipped(IngestionTask::new(chunk(0), "T", false));
        assert!(outcome.was_skipped());
        assert_eq!(outcome.attempts, 0);

        let failed = IngestionOutcome::failure(IngestionTask::new(chunk(1), "T", false), 0, "boom");
        assert!(!failed.was_skipped());
    }

    #[test]
    fn failure_policy_serde_names() {
        assert_eq!(
            serde_json::to_string(&FailurePolicy::BestEffort).unwrap(),
            "\"best_effort\""
        );
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
    }
}
