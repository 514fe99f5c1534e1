//! Error types shared across the engine.
//!
//! None of these ever reach the host page: persistence errors are absorbed by
//! the write scheduler, host-query errors degrade to empty results, and
//! engine errors are only returned from explicit commands.

use crate::groups::GroupId;

/// Failure reported by a [`PersistentStore`](crate::store::PersistentStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend throttled the write (too many operations per minute/hour).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Payload exceeded the backend's per-item or total quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Host context was torn down (extension reloaded, page unloading).
    #[error("context invalidated: {0}")]
    ContextInvalid(String),

    /// Anything else the backend reported.
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Classify a raw backend failure message.
    ///
    /// Backends only report free-form messages, so the failure mode is
    /// recovered by inspecting the text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if lower.contains("max_write_operations")
            || lower.contains("rate limit")
            || lower.contains("too many")
        {
            StoreError::RateLimited(message)
        } else if lower.contains("quota") {
            StoreError::QuotaExceeded(message)
        } else if lower.contains("context invalidated")
            || lower.contains("extension context")
            || lower.contains("context invalid")
        {
            StoreError::ContextInvalid(message)
        } else {
            StoreError::Other(message)
        }
    }
}

/// Failure while querying the host page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("malformed selector: {0}")]
    MalformedSelector(String),

    #[error("node detached from document")]
    DetachedNode,

    #[error("session container not present")]
    ContainerMissing,
}

/// Failure returned from engine lifecycle calls and sibling-UI commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("engine is not running")]
    NotRunning,

    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("group name must not be empty")]
    EmptyName,
}
