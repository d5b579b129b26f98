//! Error types for the bamboo client.
//!
//! Failures fall into two disjoint groups. Client-side validation failures
//! (`Validation`, `Unbound`) are raised before any request leaves the process.
//! Transport and server failures are collapsed into `Remote`. Outcomes that are
//! a legitimate "no" (an empty query, removing an unknown calculation, a merge
//! the server refuses) are not errors at all and are returned as `false`,
//! `None` or an empty collection by the operations themselves.

use thiserror::Error;

/// Result type alias for bamboo client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the bamboo client
#[derive(Error, Debug)]
pub enum Error {
    /// Arguments were rejected before any request was sent
    #[error("validation error: {0}")]
    Validation(String),

    /// The dataset handle has no server identifier
    #[error("dataset is not bound to a server identifier")]
    Unbound,

    /// Network failure, non-success status or an undecodable body
    #[error("remote request failed{}: {message}", status_suffix(.status))]
    Remote {
        /// HTTP status code, when one was received
        status: Option<u16>,
        /// Message from the server or the transport
        message: String,
    },

    /// Reading a local source file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A polling helper gave up before the resource settled
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Remote {
            status,
            message: message.into(),
        }
    }

    /// True for failures detected before transmission.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Unbound)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }

    /// A 4xx answer: the server understood the request and declined it.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Error::Remote { status: Some(400..=499), .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Remote {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
