//! Error types for document handles

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    /// Import payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Export payload could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Import would leave a gap in a peer's operation sequence
    #[error("Missing dependencies from {peer}: expected counter {expected}, got {found}")]
    MissingDependencies {
        peer: String,
        expected: u64,
        found: u64,
    },

    /// A thread panicked while holding the document lock
    #[error("Document lock poisoned")]
    Poisoned,
}

pub type DocResult<T> = Result<T, DocumentError>;
