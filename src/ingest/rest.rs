//! HTTP client for the ingestion and query endpoints.
//!
//! Chunks are streamed from disk (optionally gzip-compressed into a temp
//! file first) to `POST /v1/rest/ingest/{database}/{table}` with the dedup
//! key as both ingest-by and ingest-if-not-exists tag. Transient failures
//! (429, 5xx, dropped connections) are retried with exponential backoff.
//!
//! Tokens never reach logs, and only URL paths are logged.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use url::Url;

use super::client::{ChunkSource, IngestClient};
use super::{IngestReceipt, IngestionTask};
use crate::config::PipelineConfig;
use crate::error::{sanitize_message, PipelineError};
use crate::query::{build_query_text, CallDetailFilter, CallDetailQuery};
use crate::records::CallDetail;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

const CLIENT_USER_AGENT: &str = concat!("cdr-ingest/", env!("CARGO_PKG_VERSION"));

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Upper bound for a single backoff sleep, `Retry-After` included.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

const INGEST_BY_TAG_HEADER: &str = "X-Ingest-By-Tag";
const INGEST_IF_NOT_EXISTS_HEADER: &str = "X-Ingest-If-Not-Exists";
const ADDITIONAL_TAG_HEADER: &str = "X-Ingest-Additional-Tag";

/// Columns the destination may return as strings but that are numeric here.
const NUMERIC_COLUMNS: &[&str] = &["caller_id", "recipient", "duration", "cost"];

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    db: &'a str,
    csl: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryResponse {
    tables: Vec<QueryTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryTable {
    columns: Vec<QueryColumn>,
    rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryColumn {
    column_name: String,
}

#[derive(Debug, Deserialize)]
struct DestinationErrorBody {
    error: Option<DestinationErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct DestinationErrorDetail {
    message: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// RestIngestClient
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable REST client; clones share the connection pool.
#[derive(Clone)]
pub struct RestIngestClient {
    http: reqwest::Client,
    base_url: Url,
    database: String,
    table: String,
    access_token: Option<SecretString>,
    max_retries: u32,
    backoff: Duration,
    host: String,
}

impl std::fmt::Debug for RestIngestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestIngestClient")
            .field("base_url", &sanitize_url_for_logs(&self.base_url))
            .field("database", &self.database)
            .field("table", &self.table)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RestIngestClient {
    /// Creates a client for `database` behind `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client fails to initialize.
    pub fn new(base_url: Url, database: impl Into<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            http: build_http_client(Duration::from_secs(DEFAULT_TIMEOUT_SECS))?,
            base_url,
            database: database.into(),
            table: "CallDetails".to_string(),
            access_token: None,
            max_retries: 3,
            backoff: Duration::from_millis(500),
            host: local_host_name(),
        })
    }

    /// Builds a client from the `destination` and `ingest` sections.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let raw = config
            .destination
            .url
            .as_deref()
            .ok_or_else(|| PipelineError::Config("destination.url is required".to_string()))?;
        let base_url = Url::parse(raw)
            .map_err(|e| PipelineError::Config(format!("Invalid destination.url: {}", e)))?;

        let mut client = Self::new(base_url, config.destination.database.clone())?
            .with_table(config.ingest.table.clone())
            .with_retry(config.ingest.max_retries, config.ingest.retry_backoff());
        if let Some(secs) = config.destination.timeout_secs {
            client.http = build_http_client(Duration::from_secs(secs))?;
        }
        if let Some(token) = config.destination.access_token() {
            client = client.with_access_token(token);
        }
        Ok(client)
    }

    pub fn with_access_token(mut self, token: SecretString) -> Self {
        self.access_token = Some(token);
        self
    }

    /// Table queried by [`CallDetailQuery`]. Ingestion uses the task's table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Retries after the first attempt, and the initial backoff.
    pub fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    fn ingest_url(&self, table: &str) -> Result<Url, PipelineError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PipelineError::Config("destination.url cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(["v1", "rest", "ingest", self.database.as_str(), table]);
        url.query_pairs_mut().append_pair("streamFormat", "csv");
        Ok(url)
    }

    fn query_url(&self) -> Result<Url, PipelineError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PipelineError::Config("destination.url cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(["v1", "rest", "query"]);
        Ok(url)
    }

    /// Ingests a chunk, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns `Ingestion` carrying the attempt count once retries are
    /// exhausted or a permanent error is hit.
    pub async fn ingest_chunk(
        &self,
        source: &mut ChunkSource,
        task: &IngestionTask,
    ) -> Result<IngestReceipt, PipelineError> {
        let url = self.ingest_url(&task.destination_table)?;
        let tag = format!(
            "Ingested from {}, started at {}",
            self.host,
            chrono::Utc::now().to_rfc3339()
        );

        // Compressed once, replayed for every attempt.
        let compressed = if task.compress {
            Some(gzip_to_temp(source.path()).await?)
        } else {
            None
        };

        let mut attempt: u32 = 0;
        let mut delay = self.backoff;
        loop {
            attempt += 1;

            let file = match &compressed {
                Some(tmp) => tokio::fs::File::open(tmp.path())
                    .await
                    .map_err(|e| PipelineError::io("opening compressed payload", e))?,
                None => source.rewind().await?,
            };
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

            match self.send_once(&url, body, task, &tag, compressed.is_some()).await {
                Ok(deduplicated) => {
                    return Ok(IngestReceipt {
                        attempts: attempt,
                        deduplicated,
                    })
                }
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let wait = match &e {
                        PipelineError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => delay,
                    }
                    .min(MAX_BACKOFF);
                    warn!(
                        "[INGEST-REST] {} attempt {} failed ({}), retrying in {:?}",
                        task.dedup_key, attempt, e, wait
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    return Err(PipelineError::Ingestion {
                        dedup_key: task.dedup_key.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// One POST. Returns whether the destination reported a duplicate.
    async fn send_once(
        &self,
        url: &Url,
        body: reqwest::Body,
        task: &IngestionTask,
        tag: &str,
        compressed: bool,
    ) -> Result<bool, PipelineError> {
        let mut request = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "text/csv")
            .header(INGEST_BY_TAG_HEADER, &task.dedup_key)
            .header(INGEST_IF_NOT_EXISTS_HEADER, &task.dedup_key)
            .header(ADDITIONAL_TAG_HEADER, tag)
            .body(body);
        if compressed {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::ConnectionFailed(format!("Ingest request failed: {}", e)))?;

        let status = response.status();
        info!(
            "[INGEST-REST] POST {} [{}] -> {}",
            sanitize_url_for_logs(url),
            task.dedup_key,
            status.as_u16()
        );

        if status.is_success() {
            Ok(false)
        } else if status == StatusCode::CONFLICT {
            Ok(true)
        } else {
            Err(parse_error_response(response, status).await)
        }
    }

    /// Runs a call-detail query against the configured table.
    pub async fn query_call_details(
        &self,
        filter: &CallDetailFilter,
    ) -> Result<Vec<CallDetail>, PipelineError> {
        let url = self.query_url()?;
        let text = build_query_text(&self.table, filter);

        let mut request = self.http.post(url.clone()).json(&QueryRequest {
            db: &self.database,
            csl: &text,
        });
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::ConnectionFailed(format!("Query request failed: {}", e)))?;

        let status = response.status();
        info!(
            "[QUERY-REST] POST {} -> {}",
            sanitize_url_for_logs(&url),
            status.as_u16()
        );
        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Internal(format!("Failed to parse query response: {}", e)))?;

        match parsed.tables.into_iter().next() {
            Some(table) => rows_to_records(table),
            None => Ok(Vec::new()),
        }
    }
}

impl IngestClient for RestIngestClient {
    fn ingest<'a>(
        &'a self,
        mut source: ChunkSource,
        task: &'a IngestionTask,
    ) -> Pin<Box<dyn Future<Output = Result<IngestReceipt, PipelineError>> + Send + 'a>> {
        Box::pin(async move { self.ingest_chunk(&mut source, task).await })
    }
}

impl CallDetailQuery for RestIngestClient {
    fn query<'a>(
        &'a self,
        filter: &'a CallDetailFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CallDetail>, PipelineError>> + Send + 'a>> {
        Box::pin(self.query_call_details(filter))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_http_client(timeout: Duration) -> Result<reqwest::Client, PipelineError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Path only: no scheme, host, query or fragment.
fn sanitize_url_for_logs(url: &Url) -> String {
    url.path().to_string()
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Gzips `path` into a temp file that is removed on drop.
async fn gzip_to_temp(path: &Path) -> Result<NamedTempFile, PipelineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut input = std::fs::File::open(&path)
            .map_err(|e| PipelineError::io(format!("opening {}", path.display()), e))?;
        let tmp = NamedTempFile::new()
            .map_err(|e| PipelineError::io("creating compressed payload", e))?;
        let mut encoder = GzEncoder::new(tmp, Compression::default());
        std::io::copy(&mut input, &mut encoder)
            .map_err(|e| PipelineError::io(format!("compressing {}", path.display()), e))?;
        encoder
            .finish()
            .map_err(|e| PipelineError::io("finishing compressed payload", e))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Compression task join error: {}", e)))?
}

/// Classifies a non-success response.
async fn parse_error_response(response: reqwest::Response, status: StatusCode) -> PipelineError {
    // Check for rate limiting
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        return PipelineError::RateLimited {
            retry_after_secs: retry_after,
        };
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Unable to read error body"));

    let message = serde_json::from_str::<DestinationErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|d| d.message)
        .unwrap_or(body);

    PipelineError::Destination {
        status: status.as_u16(),
        message: sanitize_message(&message, "Destination error (details redacted)"),
    }
}

/// Maps a tabular query result onto records by column name.
fn rows_to_records(table: QueryTable) -> Result<Vec<CallDetail>, PipelineError> {
    let names: Vec<String> = table.columns.into_iter().map(|c| c.column_name).collect();

    table
        .rows
        .into_iter()
        .map(|row| {
            let object: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .cloned()
                .zip(row)
                .map(|(name, value)| {
                    let value = coerce_numeric(&name, value);
                    (name, value)
                })
                .collect();
            serde_json::from_value(serde_json::Value::Object(object))
                .map_err(|e| PipelineError::Internal(format!("Unexpected query row: {}", e)))
        })
        .collect()
}

fn coerce_numeric(column: &str, value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if NUMERIC_COLUMNS.contains(&column) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                serde_json::Value::Null
            } else if let Ok(n) = trimmed.parse::<i64>() {
                n.into()
            } else if let Ok(f) = trimmed.parse::<f64>() {
                f.into()
            } else {
                serde_json::Value::String(s)
            }
        }
        other => other,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
