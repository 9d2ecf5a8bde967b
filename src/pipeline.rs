//! The upload operation: split on the blocking pool, then dispatch.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::ingest::{IngestClient, IngestScheduler, IngestionCoordinator, IngestionOutcome};
use crate::streaming::{split_reader, Chunk, MergeColumns, RowTransformer, SourceStream, StreamSplitter};
use crate::validation::SchemaValidator;

/// What an upload produced.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub prefix: String,
    pub chunks: Vec<Chunk>,
    pub outcomes: Vec<IngestionOutcome>,
    pub total_rows: u64,
}

/// Chunk prefix for an uploaded file: its stem, or a fresh UUID.
pub fn prefix_for(file_name: &str) -> String {
    Path::new(file_name.trim())
        .file_stem()
        .map(|s| s.to_string_lossy().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Builds the splitter and transform described by `config`.
pub fn splitter_for(
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> (StreamSplitter, Option<Arc<dyn RowTransformer>>) {
    let mut splitter =
        StreamSplitter::new(config.split.output_dir()).with_cancellation(cancel.clone());
    if config.split.validate_schema {
        splitter = splitter.with_schema(SchemaValidator::cdr());
    }
    let transform: Option<Arc<dyn RowTransformer>> = if config.split.merge_date_time {
        Some(Arc::new(MergeColumns::cdr()))
    } else {
        None
    };
    (splitter, transform)
}

/// Splits `reader` into chunks and ingests them through `client`.
///
/// # Errors
///
/// Propagates the first splitting or ingestion error. Chunks written
/// before the failure stay on disk.
pub async fn upload<R, C>(
    reader: R,
    file_name: &str,
    config: &PipelineConfig,
    client: C,
    cancel: CancellationToken,
) -> Result<UploadReport, PipelineError>
where
    R: Read + Send + 'static,
    C: IngestClient,
{
    config.validate()?;
    let scheduler = IngestScheduler::new(config.ingest.max_concurrency)?;
    upload_with_scheduler(reader, file_name, config, client, scheduler, cancel).await
}

/// Like [`upload`], but ingestion slots come from `scheduler`, so concurrent
/// uploads sharing it stay within one destination-wide limit.
pub async fn upload_with_scheduler<R, C>(
    reader: R,
    file_name: &str,
    config: &PipelineConfig,
    client: C,
    scheduler: IngestScheduler,
    cancel: CancellationToken,
) -> Result<UploadReport, PipelineError>
where
    R: Read + Send + 'static,
    C: IngestClient,
{
    config.validate()?;
    let encoding = config.split.encoding()?;
    let prefix = prefix_for(file_name);
    let (splitter, transform) = splitter_for(config, &cancel);

    info!(file = %file_name, prefix = %prefix, "[UPLOAD] Split started");
    let started = Instant::now();
    let chunks = split_reader(
        splitter,
        SourceStream::new(reader, encoding),
        Some(prefix.clone()),
        config.split.bound,
        transform,
    )
    .await?;
    let total_rows: u64 = chunks.iter().map(|c| c.row_count).sum();
    info!(
        prefix = %prefix,
        chunks = chunks.len(),
        total_rows,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "[UPLOAD] Split finished"
    );

    let coordinator = IngestionCoordinator::with_shared_scheduler(client, &config.ingest, scheduler)
        .with_cancellation(cancel);

    info!(prefix = %prefix, chunks = chunks.len(), "[UPLOAD] Dispatch started");
    let started = Instant::now();
    let report = coordinator.dispatch(chunks.clone()).await?;
    info!(
        prefix = %prefix,
        ingested = report.total(),
        deduplicated = report.deduplicated(),
        attempts = report.attempts(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "[UPLOAD] Dispatch finished"
    );

    Ok(UploadReport {
        prefix,
        chunks,
        outcomes: report.outcomes,
        total_rows,
    })
}
