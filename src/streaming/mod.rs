//! Streaming utilities for splitting very large CSV inputs.
//!
//! The source is read forward-only, one line at a time, and written into
//! bounded chunk files that each repeat the header. Memory use stays flat
//! regardless of input size.

mod chunk_writer;
mod line_reader;
mod splitter;
mod transform;

pub use chunk_writer::{chunk_path, encoded_len, BoundPolicy, Chunk};
pub use line_reader::LineReader;
pub use splitter::{split_file, split_reader, SourceStream, StreamSplitter};
pub use transform::{MergeColumns, RowTransformer, TransformFailure, CALL_END_DATETIME};
