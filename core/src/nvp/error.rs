//! Error types for upstream NVP calls.
//!
//! A non-success `ACK` is not an error here: the upstream answered, and
//! the decoded body is returned as data. Only failures to get an answer
//! at all end up in [`NvpError`].

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NvpError {
    /// Connection, TLS or body-read failure.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream answered with a non-2xx HTTP status.
    #[error("upstream returned HTTP {status}")]
    HttpStatus {
        status: u16,
        /// Decoded body, when there was one. Kept for the error record.
        body: String,
    },

    /// No answer within the call deadline.
    #[error("upstream call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The transport could not be constructed (bad TLS setup, etc.).
    #[error("transport setup failed: {0}")]
    Setup(String),
}

impl NvpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, NvpError::Timeout(_))
    }

    /// Upstream HTTP status, if the upstream got as far as sending one.
    pub fn status(&self) -> Option<u16> {
        match self {
            NvpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type NvpResult<T> = Result<T, NvpError>;
