//! Per-endpoint call budgets and failure backoff
//!
//! One [`BackoffController`] is shared by the token manager, the sync engine
//! and document retrieval, so a 429 seen by one caller slows down all of them.

mod backoff;

pub use backoff::{BackoffController, BackoffSettings, EndpointBudget, EndpointStats};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upstream endpoint groups tracked independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Token,
    ListMessages,
    Download,
    Revoke,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 4] = [
        EndpointClass::Token,
        EndpointClass::ListMessages,
        EndpointClass::Download,
        EndpointClass::Revoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Token => "token",
            EndpointClass::ListMessages => "list_messages",
            EndpointClass::Download => "download",
            EndpointClass::Revoke => "revoke",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller does when no permit is available right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return `RateLimited` immediately
    FailFast,
    /// Sleep until a permit frees up, but never longer than this
    WaitUpTo(Duration),
}

/// How an upstream call ended, from the controller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// 429, optionally with the server's Retry-After
    RateLimited(Option<Duration>),
    /// 5xx, timeout or transport error
    Unavailable,
    /// A failure that says nothing about upstream health (4xx, parse errors)
    Neutral,
}
