//! Error types for generation and patching

use kiln_core::KilnError;
use thiserror::Error;

/// A generation step that could not produce usable output
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generator call failed: {0}")]
    Transport(#[from] KilnError),

    #[error("Failed to encode generator input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No usable output after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
}

/// A patch that cannot be applied at all
///
/// Per-file problems (a hunk that does not match, an empty section) are
/// recorded in the report instead; these variants reject the whole patch.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch contains no file sections")]
    NoSections,

    #[error("Malformed patch path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    #[error("Patch path escapes the workspace: {path}")]
    PathOutsideWorkspace { path: String },

    #[error("Patch changed no files ({details})")]
    NothingApplied { details: String },

    #[error("Failed to write patched file: {0}")]
    Write(KilnError),
}

impl PatchError {
    /// Map a workspace path-resolution error onto the patch taxonomy
    pub(crate) fn from_resolve(err: KilnError) -> Self {
        match err {
            KilnError::PathOutsideWorkspace(path) => Self::PathOutsideWorkspace { path },
            KilnError::MalformedPath { path, reason } => Self::MalformedPath { path, reason },
            other => Self::Write(other),
        }
    }
}
