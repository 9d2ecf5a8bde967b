//! Pipeline configuration.
//!
//! All knobs are passed explicitly into the splitter and coordinator per
//! invocation; nothing here is global. The defaults mirror the production
//! deployment: ten million rows per chunk (roughly 500 MB of CDR data),
//! a single ingestion in flight, three retries and compressed payloads.
//!
//! ```toml
//! [split]
//! bound = { rows = 1000000 }
//! output_dir = "/var/tmp/cdr"
//!
//! [ingest]
//! max_concurrency = 4
//! table = "CallDetails"
//!
//! [destination]
//! url = "https://ingest.example.net"
//! database = "telemetry"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ingest::FailurePolicy;
use crate::streaming::BoundPolicy;

/// Environment variable that overrides `destination.access_token`.
pub const TOKEN_ENV_VAR: &str = "CDR_INGEST_TOKEN";

/// Default number of data rows per chunk.
pub const DEFAULT_MAX_ROWS: u64 = 10_000_000;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub split: SplitConfig,
    pub ingest: IngestConfig,
    pub destination: DestinationConfig,
}

/// Controls how the source stream is cut into chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    /// Row-count or byte-size bound for each chunk.
    pub bound: BoundPolicy,
    /// Reject inputs whose header is not the CDR input schema.
    pub validate_schema: bool,
    /// Merge `call_date` and `end_time` into `call_end_datetime`.
    pub merge_date_time: bool,
    /// Directory for chunk artifacts. Defaults to the OS temp dir.
    pub output_dir: Option<PathBuf>,
    /// Encoding label used when the input has no byte-order mark.
    pub encoding: String,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            bound: BoundPolicy::Rows(DEFAULT_MAX_ROWS),
            validate_schema: true,
            merge_date_time: true,
            output_dir: None,
            encoding: "utf-8".to_string(),
        }
    }
}

impl SplitConfig {
    /// Returns the configured output directory or the OS temp dir.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Resolves the configured encoding label.
    pub fn encoding(&self) -> Result<&'static encoding_rs::Encoding, PipelineError> {
        encoding_rs::Encoding::for_label(self.encoding.trim().as_bytes()).ok_or_else(|| {
            PipelineError::Config(format!("unknown text encoding: {}", self.encoding))
        })
    }
}

/// Controls the ingestion dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Maximum chunks ingested concurrently.
    pub max_concurrency: usize,
    /// Retries per chunk, performed by the ingest client.
    pub max_retries: u32,
    /// Initial delay between retries, doubled on each attempt.
    pub retry_backoff_ms: u64,
    /// Send gzip-compressed payloads.
    pub compress: bool,
    /// Destination table.
    pub table: String,
    /// What to do with sibling chunks once one fails.
    pub failure_policy: FailurePolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            max_retries: 3,
            retry_backoff_ms: 500,
            compress: true,
            table: "CallDetails".to_string(),
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

impl IngestConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Where chunks are sent.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DestinationConfig {
    /// Base URL of the ingestion service.
    pub url: Option<String>,
    /// Database that owns the destination table.
    pub database: String,
    /// Bearer token. Prefer the `CDR_INGEST_TOKEN` environment variable.
    pub access_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl std::fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("url", &self.url)
            .field("database", &self.database)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl DestinationConfig {
    /// Returns the access token, preferring the environment override.
    pub fn access_token(&self) -> Option<SecretString> {
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.access_token.clone())
            .map(SecretString::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl PipelineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }

    /// Rejects values that would stall or break the pipeline.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self.split.bound {
            BoundPolicy::Rows(0) => {
                return Err(PipelineError::Config("split.bound.rows must be greater than 0".into()))
            }
            BoundPolicy::Bytes(0) => {
                return Err(PipelineError::Config("split.bound.bytes must be greater than 0".into()))
            }
            _ => {}
        }
        if self.ingest.max_concurrency == 0 {
            return Err(PipelineError::Config(
                "ingest.max_concurrency must be greater than 0".into(),
            ));
        }
        if self.ingest.table.trim().is_empty() {
            return Err(PipelineError::Config("ingest.table must not be empty".into()));
        }
        self.split.encoding()?;
        Ok(())
    }
}
