//! # kiln-extract
//!
//! Turns raw generator text into canonical generated files.
//!
//! Three steps, each usable on its own:
//!
//! 1. [`extract_document`] finds exactly one structured document in the text
//! 2. [`parse_document`] parses it, running the [`repair`] pipeline only if
//!    the first parse fails
//! 3. [`normalize_files`] / [`normalize_artifact`] classify the document's
//!    shape and flatten it into `(path, content)` records

mod error;
pub mod extractor;
pub mod normalizer;
pub mod repair;

pub use error::ExtractError;
pub use extractor::extract_document;
pub use normalizer::{detect_shape, normalize_artifact, normalize_files, DocumentShape};
pub use repair::{parse_document, repair, RepairStage, REPAIR_PIPELINE};

/// Extract, parse and normalize in one call
pub fn extract_artifact(
    raw: &str,
    layout: &kiln_core::ArtifactLayout,
) -> Result<kiln_core::GeneratedArtifact, ExtractError> {
    let candidate = extract_document(raw)?;
    let doc = parse_document(&candidate)?;
    Ok(normalize_artifact(&doc, layout))
}
