//! In-memory destination for tests and dry runs.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::client::{ChunkSource, IngestClient};
use super::{IngestReceipt, IngestionTask};
use crate::error::PipelineError;
use crate::query::{CallDetailFilter, CallDetailQuery};
use crate::records::{read_call_details, CallDetail};

#[derive(Debug, Default)]
struct StoreState {
    tags: HashSet<String>,
    records: Vec<CallDetail>,
}

/// Holds ingested call details and honours ingest-if-not-exists tags.
///
/// Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Dedup tags seen so far.
    pub async fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state.lock().await.tags.iter().cloned().collect();
        tags.sort();
        tags
    }
}

impl IngestClient for MemoryStore {
    fn ingest<'a>(
        &'a self,
        mut source: ChunkSource,
        task: &'a IngestionTask,
    ) -> Pin<Box<dyn Future<Output = Result<IngestReceipt, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            if self.state.lock().await.tags.contains(&task.dedup_key) {
                return Ok(IngestReceipt {
                    attempts: 1,
                    deduplicated: true,
                });
            }

            let bytes = source.read_all().await?;
            let records = read_call_details(bytes.as_slice()).map_err(|e| {
                PipelineError::Destination {
                    status: 400,
                    message: format!("malformed chunk {}: {}", task.dedup_key, e),
                }
            })?;

            let mut state = self.state.lock().await;
            // Re-check under the write lock; a concurrent ingest may have won.
            if !state.tags.insert(task.dedup_key.clone()) {
                return Ok(IngestReceipt {
                    attempts: 1,
                    deduplicated: true,
                });
            }
            state.records.extend(records);
            Ok(IngestReceipt {
                attempts: 1,
                deduplicated: false,
            })
        })
    }
}

impl CallDetailQuery for MemoryStore {
    fn query<'a>(
        &'a self,
        filter: &'a CallDetailFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CallDetail>, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .records
                .iter()
                .filter(|r| filter.caller.map_or(true, |c| r.caller_id == Some(c)))
                .take(filter.take.unwrap_or(usize::MAX))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::Chunk;
    use crate::validation::CDR_OUTPUT_HEADER;
    use tempfile::TempDir;

    async fn chunk_with(dir: &TempDir, name: &str, rows: &[&str]) -> (ChunkSource, IngestionTask) {
        let path = dir.path().join(name);
        let mut text = format!("{}\n", CDR_OUTPUT_HEADER);
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        tokio::fs::write(&path, &text).await.unwrap();
        let chunk = Chunk {
            sequence: 0,
            path: path.clone(),
            row_count: rows.len() as u64,
            byte_size: text.len() as u64,
            header: CDR_OUTPUT_HEADER.into(),
        };
        (
            ChunkSource::open(&path).await.unwrap(),
            IngestionTask::new(chunk, "CallDetails", false),
        )
    }

    const ROW_A: &str = "441215598896,448000096481,16/08/2016 14:21:33,43,0,C5DA9724701EE,GBP";
    const ROW_B: &str = "442036000000,448000096481,16/08/2016 14:00:47,31,0,C50B5A7BDB8D4,GBP";

    #[tokio::test]
    async fn reingesting_the_same_key_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();

        let (source, task) = chunk_with(&dir, "u_0.csv", &[ROW_A, ROW_B]).await;
        let first = store.ingest(source, &task).await.unwrap();
        assert!(!first.deduplicated);

        let (source, task) = chunk_with(&dir, "u_0.csv", &[ROW_A, ROW_B]).await;
        let second = store.ingest(source, &task).await.unwrap();
        assert!(second.deduplicated);

        assert_eq!(store.len().await, 2);
        assert_eq!(store.tags().await, vec!["u_0.csv".to_string()]);
    }

    #[tokio::test]
    async fn filters_by_caller_and_take() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let (source, task) = chunk_with(&dir, "u_0.csv", &[ROW_A, ROW_B, ROW_A]).await;
        store.ingest(source, &task).await.unwrap();

        let by_caller = store
            .query(&CallDetailFilter {
                caller: Some(441215598896),
                take: None,
            })
            .await
            .unwrap();
        assert_eq!(by_caller.len(), 2);

        let capped = store
            .query(&CallDetailFilter {
                caller: None,
                take: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn malformed_chunk_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let (source, task) = chunk_with(&dir, "u_0.csv", &["1,2,x,not-a-number,0,r,GBP"]).await;
        let err = store.ingest(source, &task).await.unwrap_err();
        assert!(matches!(err, PipelineError::Destination { status: 400, .. }));
        assert!(store.is_empty().await);
    }
}
