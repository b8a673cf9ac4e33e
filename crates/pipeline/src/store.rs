//! The external artefact store port.
//!
//! The store is the single source of truth and the only shared mutable
//! resource. Everything the engine knows about a run is read from it at the
//! start of an invocation; everything it learns is appended to it before the
//! invocation ends. Implementations live in infrastructure crates (`github`)
//! and in [`crate::testing`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    CommentId, LockMarker, RetryPolicy, SubWorkItem, SubWorkItemId, Timestamp, WorkItem,
    WorkItemRef,
};

/// Errors produced by an [`ArtifactStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("work item {0} not found")]
    NotFound(String),

    #[error("store rate limit reached; retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("store request failed: {0}")]
    Transport(String),

    #[error("store rejected the request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("store response could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the failed call is worth retrying on a later trigger.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Transport(_) => RetryPolicy::Retryable { after: None },
            Self::Api { status, .. } if *status >= 500 => RetryPolicy::Retryable { after: None },
            Self::NotFound(_) | Self::Api { .. } | Self::Decode(_) => RetryPolicy::NonRetryable,
        }
    }
}

/// A comment on a work item, in store order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredComment {
    pub id: CommentId,
    pub body: String,
    pub created_at: Timestamp,
    /// `true` when the comment was written by the engine's own identity.
    ///
    /// Only engine-authored comments are trusted as run records; only
    /// human-authored comments are accepted as approval commands.
    pub authored_by_engine: bool,
}

/// Parameters for creating a sub-work-item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubWorkItem {
    pub title: String,
    pub body: String,
    pub depends_on: Vec<SubWorkItemId>,
    pub labels: Vec<String>,
}

/// Access to the externally persisted state of work items.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Reads the work item (title, body, labels, open/closed state, parent link).
    async fn work_item(&self, item: &WorkItemRef) -> Result<WorkItem, StoreError>;

    /// Every comment on the item, oldest first.
    async fn comments(&self, item: &WorkItemRef) -> Result<Vec<StoredComment>, StoreError>;

    /// Appends a comment authored by the engine.
    async fn append_comment(&self, item: &WorkItemRef, body: &str)
        -> Result<CommentId, StoreError>;

    /// Adds a label (no-op if present).
    async fn add_label(&self, item: &WorkItemRef, label: &str) -> Result<(), StoreError>;

    /// Removes a label (no-op if absent).
    async fn remove_label(&self, item: &WorkItemRef, label: &str) -> Result<(), StoreError>;

    /// Reads the processing lock marker.
    async fn read_lock(&self, item: &WorkItemRef) -> Result<Option<LockMarker>, StoreError>;

    /// Replaces the lock marker with `replacement` only if the current marker
    /// equals `expected`. Returns whether the swap happened.
    ///
    /// This is the single atomic read-modify-write the lock manager relies on.
    async fn compare_and_swap_lock(
        &self,
        item: &WorkItemRef,
        expected: Option<&LockMarker>,
        replacement: Option<&LockMarker>,
    ) -> Result<bool, StoreError>;

    /// Sub-work-items previously created under `parent`.
    async fn sub_work_items(&self, parent: &WorkItemRef) -> Result<Vec<SubWorkItem>, StoreError>;

    /// Creates a sub-work-item under `parent`.
    async fn create_sub_work_item(
        &self,
        parent: &WorkItemRef,
        item: &NewSubWorkItem,
    ) -> Result<SubWorkItemId, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let server = StoreError::Api {
            status: 502,
            message: "bad gateway".into(),
        };
        let client = StoreError::Api {
            status: 422,
            message: "validation failed".into(),
        };
        assert_eq!(server.retry_policy(), RetryPolicy::Retryable { after: None });
        assert_eq!(client.retry_policy(), RetryPolicy::NonRetryable);
    }
}
