//! Shared utilities.

pub mod fs;
pub mod json_extraction;

pub use fs::write_atomic;
pub use json_extraction::{extract_json_object, find_matching_brace, JsonExtractionError};
