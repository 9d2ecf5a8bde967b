//! Splits very large call-detail-record CSV files into bounded chunks and
//! ingests them into an analytical store with per-chunk deduplication.
//!
//! Data flows one way: source stream → chunks (sequential, blocking pool)
//! → ingestion (parallel, bounded). See [`pipeline::upload`].

pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod query;
pub mod records;
pub mod streaming;
pub mod validation;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{upload, upload_with_scheduler, UploadReport};
