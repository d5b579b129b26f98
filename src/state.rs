//! Lifecycle of server-computed resources.
//!
//! The server owns the state machine. The client only observes it: every
//! [`Refresh::refresh`] re-reads the authoritative state and replaces whatever
//! snapshot the handle held before. Nothing here sleeps or retries; see
//! [`crate::poll`] for an optional waiting helper.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Accepted by the server, computation not finished
    #[default]
    Pending,
    /// Computation finished, data is queryable
    Ready,
    /// Terminal failure reported by the server
    #[serde(alias = "failed")]
    Error,
}

impl ResourceState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ResourceState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Pending => "pending",
            ResourceState::Ready => "ready",
            ResourceState::Error => "error",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResourceState::Pending),
            "ready" => Ok(ResourceState::Ready),
            "error" | "failed" => Ok(ResourceState::Error),
            other => Err(format!("unknown resource state: {}", other)),
        }
    }
}

/// A handle whose state can be re-read from the server.
#[async_trait]
pub trait Refresh: Send {
    /// Short label used in logs and timeout errors.
    fn describe(&self) -> String;

    /// One round trip; returns the state the server reports right now.
    async fn refresh(&mut self) -> Result<ResourceState>;
}
