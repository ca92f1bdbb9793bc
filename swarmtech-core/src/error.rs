use thiserror::Error;

/// Errors raised by the replicated document and the data model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),
    #[error("Decompression failed: {0}")]
    Decompression(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
    #[error("Unknown role: {0}")]
    UnknownRole(String),
}
