//! Error types for the playback engine.
//!
//! Parse and decode failures are recovered locally by the preload jobs and
//! never escape a job. Transport and protocol failures end the job and reach
//! the caller through the job outcome. State errors are not errors at all:
//! mutators return `false` and leave the slot untouched.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed multipart part (skipped by the parser).
    #[error("malformed multipart part: {0}")]
    Parse(String),

    /// Part bytes could not become a raster image.
    #[error("failed to decode frame {frame}: {reason}")]
    Decode { frame: u32, reason: String },

    /// Fetch failed before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// Response was successful but unusable (e.g. missing boundary token).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error while reading a response body.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Request referenced an invalid slot, layout or instance.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Job finished without producing a single usable frame.
    #[error("no frames loaded for {0}")]
    Empty(String),
}

impl EngineError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for failures that end a whole preload job.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Status { .. } | Self::Protocol(_) | Self::Io(_) | Self::Empty(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}
