//! Error types for fractal-protocol.

use thiserror::Error;

/// Result type for fractal-protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum Error {
    /// The envelope could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection carried no envelope at all.
    #[error("empty frame")]
    EmptyFrame,
}
