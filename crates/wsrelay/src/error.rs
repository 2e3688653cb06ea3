//! Error types for the relay engine.

use thiserror::Error;

use crate::protocol::Issue;

/// Failure to turn raw socket text into a validated message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The text is not JSON at all.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The text is JSON but does not match the expected shape.
    #[error("invalid message: {}", format_issues(.0))]
    Invalid(Vec<Issue>),
}

impl CodecError {
    /// Issues carried by this error. A malformed message yields a single
    /// root-level issue so fail-soft callers always see a non-empty list.
    pub fn into_issues(self) -> Vec<Issue> {
        match self {
            CodecError::Malformed(e) => vec![Issue::root(format!("malformed JSON: {}", e))],
            CodecError::Invalid(issues) => issues,
        }
    }
}

fn format_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by a [`crate::store::KeyValueStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("stored value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors surfaced by the connection lifecycle.
///
/// Decode and policy failures are dropped on the message path and never
/// surface here; store failures do.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("connection {0} is closed")]
    Closed(String),

    #[error("peer id {0} is already connected")]
    DuplicatePeer(String),
}
