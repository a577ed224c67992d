//! Media file inspection: content hashing and technical metadata.

pub mod hash;
pub mod metadata;

pub use hash::compute_hashes_with_progress;
pub use metadata::{extract_metadata, ExtractedMetadata};
