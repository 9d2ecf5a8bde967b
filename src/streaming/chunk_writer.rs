//! A single open chunk artifact.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// How large a chunk may grow before the splitter starts the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundPolicy {
    /// At most this many data rows per chunk.
    Rows(u64),
    /// At most this many bytes per chunk, header included.
    Bytes(u64),
}

/// A sealed, immutable chunk artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based creation order.
    pub sequence: u32,
    pub path: PathBuf,
    /// Data rows, header excluded.
    pub row_count: u64,
    /// Bytes on disk, header included.
    pub byte_size: u64,
    pub header: String,
}

impl Chunk {
    /// Artifact file name, e.g. `calls_3.csv`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Artifact path for chunk `index` of `prefix`.
pub fn chunk_path(dir: &Path, prefix: &str, index: u32) -> PathBuf {
    dir.join(format!("{}_{}.csv", prefix, index))
}

/// Bytes a line occupies once written with its `\n` terminator.
pub fn encoded_len(line: &str) -> u64 {
    line.len() as u64 + 1
}

/// Wrapper for writing one chunk file.
///
/// The header is written on creation; counters then track the header only.
pub(crate) struct ChunkWriter {
    writer: BufWriter<File>,
    sequence: u32,
    path: PathBuf,
    header: String,
    rows: u64,
    bytes: u64,
}

impl ChunkWriter {
    pub(crate) fn create(path: PathBuf, sequence: u32, header: &str) -> Result<Self, PipelineError> {
        let file = File::create(&path)
            .map_err(|e| PipelineError::io(format!("creating chunk {}", path.display()), e))?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            sequence,
            path,
            header: header.to_string(),
            rows: 0,
            bytes: 0,
        };
        writer.write_line(header)?;
        Ok(writer)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn rows(&self) -> u64 {
        self.rows
    }

    /// True when a row of `next_len` encoded bytes must go to a new chunk.
    pub(crate) fn would_exceed(&self, bound: BoundPolicy, next_len: u64) -> bool {
        match bound {
            BoundPolicy::Rows(max) => self.rows >= max,
            // A lone row larger than the bound still gets a chunk of its own.
            BoundPolicy::Bytes(max) => self.rows > 0 && self.bytes + next_len > max,
        }
    }

    pub(crate) fn write_row(&mut self, line: &str) -> Result<(), PipelineError> {
        self.write_line(line)?;
        self.rows += 1;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), PipelineError> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| PipelineError::io(format!("writing chunk {}", self.path.display()), e))?;
        self.bytes += encoded_len(line);
        Ok(())
    }

    /// Flushes and closes the file.
    pub(crate) fn seal(mut self) -> Result<Chunk, PipelineError> {
        self.writer
            .flush()
            .map_err(|e| PipelineError::io(format!("flushing chunk {}", self.path.display()), e))?;

        tracing::debug!(
            chunk = self.sequence,
            rows = self.rows,
            bytes = self.bytes,
            "Sealed chunk"
        );

        Ok(Chunk {
            sequence: self.sequence,
            path: self.path,
            row_count: self.rows,
            byte_size: self.bytes,
            header: self.header,
        })
    }
}
