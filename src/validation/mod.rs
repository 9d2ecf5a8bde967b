//! Input validation performed before any artifact is written.

pub mod schema;

pub use schema::{normalize_header, SchemaValidator, CDR_INPUT_HEADER, CDR_OUTPUT_HEADER};
