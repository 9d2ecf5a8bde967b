//! The ingestion contract and the replayable chunk stream handed to it.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{IngestReceipt, IngestionTask};
use crate::error::PipelineError;

/// Sends one chunk to the destination with ingest-if-not-exists semantics.
///
/// Implementations are cheap to clone; the coordinator hands each task its
/// own clone and clones share connection pools. Retries live inside the
/// client, so a returned error is terminal for the chunk.
pub trait IngestClient: Clone + Send + Sync + 'static {
    fn ingest<'a>(
        &'a self,
        source: ChunkSource,
        task: &'a IngestionTask,
    ) -> Pin<Box<dyn Future<Output = Result<IngestReceipt, PipelineError>> + Send + 'a>>;
}

/// An opened chunk artifact that can be replayed from the start.
#[derive(Debug)]
pub struct ChunkSource {
    path: PathBuf,
    file: File,
    len: u64,
}

impl ChunkSource {
    /// Opens the artifact for reading.
    pub async fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)
            .await
            .map_err(|e| PipelineError::io(format!("opening chunk {}", path.display()), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| PipelineError::io(format!("reading metadata of {}", path.display()), e))?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A handle positioned at the first byte, for one attempt.
    ///
    /// Handles share the file cursor; use them one at a time.
    pub async fn rewind(&mut self) -> Result<File, PipelineError> {
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| PipelineError::io(format!("rewinding {}", self.path.display()), e))?;
        self.file
            .try_clone()
            .await
            .map_err(|e| PipelineError::io(format!("cloning handle of {}", self.path.display()), e))
    }

    /// Reads the whole artifact from the start.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, PipelineError> {
        let mut reader = self.rewind().await?;
        let mut buf = Vec::with_capacity(self.len as usize);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| PipelineError::io(format!("reading {}", self.path.display()), e))?;
        Ok(buf)
    }
}
