//! Splits one line-oriented stream into bounded chunk artifacts.
//!
//! The split is single-threaded and forward-only: a header is read once,
//! checked against the schema, then every data row is transformed and
//! appended to the open chunk until the bound forces a new one. Chunks are
//! opened lazily, so a header-only input produces none.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use encoding_rs::Encoding;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::chunk_writer::{chunk_path, encoded_len, BoundPolicy, Chunk, ChunkWriter};
use super::line_reader::LineReader;
use super::transform::RowTransformer;
use crate::error::PipelineError;
use crate::validation::{normalize_header, SchemaValidator};

/// A caller-owned byte stream plus the encoding to assume without a BOM.
///
/// Pass `&mut reader` to keep the underlying resource usable afterwards.
pub struct SourceStream<R: Read> {
    pub reader: R,
    pub encoding: &'static Encoding,
}

impl<R: Read> SourceStream<R> {
    pub fn new(reader: R, encoding: &'static Encoding) -> Self {
        Self { reader, encoding }
    }

    pub fn utf8(reader: R) -> Self {
        Self::new(reader, encoding_rs::UTF_8)
    }
}

/// Cuts a source stream into `{prefix}_{index}.csv` artifacts.
#[derive(Debug, Clone)]
pub struct StreamSplitter {
    output_dir: PathBuf,
    schema: Option<SchemaValidator>,
    cancel: Option<CancellationToken>,
}

impl StreamSplitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            schema: None,
            cancel: None,
        }
    }

    /// Rejects inputs whose normalized header differs from `schema`.
    pub fn with_schema(mut self, schema: SchemaValidator) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Stops between rows once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Splits `source` into sealed chunks, returned in creation order.
    ///
    /// # Errors
    ///
    /// - `Schema` when the header does not match; no artifact is created.
    /// - `Transform` when a row cannot be rewritten.
    /// - `Io` on read or write failure.
    /// - `Cancelled` when the cancellation token fires.
    ///
    /// In every error case the open chunk is flushed and closed first, and
    /// chunks already sealed stay on disk.
    pub fn split<R: Read>(
        &self,
        source: SourceStream<R>,
        prefix: Option<&str>,
        bound: BoundPolicy,
        transform: Option<&dyn RowTransformer>,
    ) -> Result<Vec<Chunk>, PipelineError> {
        let prefix = match prefix {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut reader = LineReader::new(source.reader, source.encoding)
            .map_err(|e| PipelineError::io("reading source header", e))?;

        let normalized = match reader
            .next_line()
            .map_err(|e| PipelineError::io("reading source header", e))?
        {
            Some(header) => normalize_header(header),
            None => {
                tracing::info!(prefix = %prefix, "[SPLIT] Empty source, nothing to split");
                return Ok(Vec::new());
            }
        };

        if let Some(schema) = &self.schema {
            schema.check(&prefix, &normalized)?;
        }

        let header = match transform {
            Some(t) => t.transform_header(&normalized),
            None => normalized,
        };

        tracing::info!(
            prefix = %prefix,
            encoding = reader.encoding().name(),
            ?bound,
            "[SPLIT] Starting split"
        );

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut open: Option<ChunkWriter> = None;

        let result = self.split_rows(
            &mut reader,
            &prefix,
            &header,
            bound,
            transform,
            &mut chunks,
            &mut open,
        );

        // Seal whatever is open on every exit path.
        if let Some(writer) = open.take() {
            let sealed = writer.seal();
            match (&result, sealed) {
                (_, Ok(chunk)) => chunks.push(chunk),
                (Ok(()), Err(e)) => return Err(e),
                (Err(_), Err(e)) => {
                    tracing::warn!(error = %e, "[SPLIT] Failed to seal chunk after error");
                }
            }
        }

        match result {
            Ok(()) => {
                let total_rows: u64 = chunks.iter().map(|c| c.row_count).sum();
                tracing::info!(
                    prefix = %prefix,
                    chunks = chunks.len(),
                    total_rows,
                    "[SPLIT] Split complete"
                );
                Ok(chunks)
            }
            Err(e) => {
                tracing::warn!(
                    prefix = %prefix,
                    sealed = chunks.len(),
                    error = %e,
                    "[SPLIT] Split aborted"
                );
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_rows<R: Read>(
        &self,
        reader: &mut LineReader<R>,
        prefix: &str,
        header: &str,
        bound: BoundPolicy,
        transform: Option<&dyn RowTransformer>,
        chunks: &mut Vec<Chunk>,
        open: &mut Option<ChunkWriter>,
    ) -> Result<(), PipelineError> {
        let mut source_row: u64 = 0;

        loop {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(PipelineError::Cancelled);
            }

            let line_number = reader.lines_read() + 1;
            let line = match reader
                .next_line()
                .map_err(|e| PipelineError::io(format!("reading source line {}", line_number), e))?
            {
                Some(line) => line,
                None => return Ok(()),
            };
            source_row += 1;

            let row = match transform {
                Some(t) => match t.transform(line) {
                    Ok(row) => row,
                    Err(failure) => {
                        // A row that would not fit the open chunk belongs to the next one.
                        let sealed = chunks.len() as u32;
                        let (file, row) = match open.as_ref() {
                            Some(w) if !w.would_exceed(bound, encoded_len(line)) => {
                                (w.path().to_path_buf(), w.rows())
                            }
                            Some(_) => (chunk_path(&self.output_dir, prefix, sealed + 1), 0),
                            None => (chunk_path(&self.output_dir, prefix, sealed), 0),
                        };
                        return Err(PipelineError::Transform {
                            file,
                            row,
                            source_row,
                            line: line.to_string(),
                            reason: failure.reason,
                        });
                    }
                },
                None => line.to_string(),
            };

            let next_len = encoded_len(&row);
            if open.as_ref().is_some_and(|w| w.would_exceed(bound, next_len)) {
                if let Some(full) = open.take() {
                    chunks.push(full.seal()?);
                }
            }

            if open.is_none() {
                *open = Some(self.open_chunk(prefix, chunks.len() as u32, header)?);
            }
            if let Some(writer) = open.as_mut() {
                writer.write_row(&row)?;
            }
        }
    }

    fn open_chunk(
        &self,
        prefix: &str,
        sequence: u32,
        header: &str,
    ) -> Result<ChunkWriter, PipelineError> {
        if sequence == 0 {
            std::fs::create_dir_all(&self.output_dir).map_err(|e| {
                PipelineError::io(
                    format!("creating output directory {}", self.output_dir.display()),
                    e,
                )
            })?;
        }
        ChunkWriter::create(chunk_path(&self.output_dir, prefix, sequence), sequence, header)
    }
}

/// Runs [`StreamSplitter::split`] on the blocking pool.
pub async fn split_reader<R>(
    splitter: StreamSplitter,
    source: SourceStream<R>,
    prefix: Option<String>,
    bound: BoundPolicy,
    transform: Option<Arc<dyn RowTransformer>>,
) -> Result<Vec<Chunk>, PipelineError>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        splitter.split(source, prefix.as_deref(), bound, transform.as_deref())
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Split task join error: {}", e)))?
}

/// Opens `path` and splits it on the blocking pool.
pub async fn split_file(
    path: &Path,
    encoding: &'static Encoding,
    splitter: StreamSplitter,
    prefix: Option<String>,
    bound: BoundPolicy,
    transform: Option<Arc<dyn RowTransformer>>,
) -> Result<Vec<Chunk>, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::io(format!("opening {}", path.display()), e))?;
    split_reader(splitter, SourceStream::new(file, encoding), prefix, bound, transform).await
}
