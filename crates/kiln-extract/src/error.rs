use thiserror::Error;

/// Why no usable document could be recovered from generator text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("No structured data found in generator output")]
    NoStructuredData,

    #[error("Multiple fenced blocks found ({count}); expected exactly one")]
    MultipleBlocks { count: usize },

    #[error("Multiple sibling top-level objects found; expected exactly one")]
    SiblingObjects,

    #[error("Invalid document after repair: {message}")]
    InvalidDocument { message: String },
}
