//! Error types for vconv.

use std::time::Duration;
use thiserror::Error;

/// Main error type for conversion operations.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No track matching media type prefix '{prefix}'")]
    NoMatchingTrack { prefix: String },

    #[error("Cannot resolve display name: {0}")]
    DisplayNameResolution(String),

    #[error("Codec configuration failed: {0}")]
    CodecConfiguration(String),

    #[error("Muxer usage error: {0}")]
    MuxerUsage(String),

    #[error("{component}: cannot {operation} in state {state}")]
    InvalidState {
        component: &'static str,
        operation: &'static str,
        state: String,
    },

    #[error("Malformed container: {0}")]
    Container(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Pipeline stalled for {0:?} without progress")]
    Stalled(Duration),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConvertError {
    /// Shorthand for an `InvalidState` error.
    pub fn invalid_state(
        component: &'static str,
        operation: &'static str,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidState {
            component,
            operation,
            state: state.to_string(),
        }
    }
}

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;
