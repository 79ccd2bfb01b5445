//! Error types for Fractal nodes.

use std::time::Duration;

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by node startup and the public node API.
///
/// Message handlers never return these to the listen loop; they log and
/// carry on.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (binding, log files, job files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope encoding/decoding failed
    #[error("Protocol error: {0}")]
    Protocol(#[from] fractal_protocol::Error),

    /// Job file could not be parsed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A peer sent more than one envelope's worth of bytes
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// Bad fractal address
    #[error("Numeral error: {0}")]
    Numeral(#[from] fractal_numeral::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No Welcome/Contact arrived in time
    #[error("join timed out after {attempts} attempt(s) of {timeout:?}")]
    JoinTimeout { attempts: u32, timeout: Duration },

    /// The operation needs a job this node has never heard of
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// A job that cannot be computed
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The operation needs an assigned id
    #[error("node has not joined the system yet")]
    NotMember,
}
