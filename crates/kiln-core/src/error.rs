//! Unified error types for Kiln

use thiserror::Error;

/// Unified error type for Kiln operations
#[derive(Error, Debug)]
pub enum KilnError {
    // Workspace errors
    #[error("Malformed path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    #[error("Path escapes the workspace: {0}")]
    PathOutsideWorkspace(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    // Collaborator errors
    #[error("Generator error: {0}")]
    Generator(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Run not found: {0}")]
    RunNotFound(u64),

    #[error("Project not found: {0}")]
    ProjectNotFound(u64),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Configuration
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using KilnError
pub type Result<T> = std::result::Result<T, KilnError>;
