//! The per-work-item processing lock.
//!
//! The lock is a marker stored next to the work item (the `cogworks:processing`
//! label plus a holder/timestamp record). Every change to it goes through the
//! store's compare-and-swap, so acquiring, overriding a stale marker and
//! releasing are each a single atomic read-modify-write: two invocations that
//! both see the same stale marker race on the swap and exactly one wins.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ArtifactStore, InvocationId, StoreError, Timestamp, WorkItemRef};

/// Default age after which a lock is considered stale.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The lock marker as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    /// The invocation holding the lock.
    pub holder: InvocationId,
    pub acquired_at: Timestamp,
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(LockMarker),
    /// A stale marker was replaced; processing proceeds.
    StaleOverride {
        marker: LockMarker,
        previous: LockMarker,
    },
    /// Another invocation holds a fresh lock.
    AlreadyHeld { since: Timestamp },
}

impl LockOutcome {
    /// The marker now owned by the caller, if the lock was obtained.
    pub fn marker(&self) -> Option<&LockMarker> {
        match self {
            Self::Acquired(marker) | Self::StaleOverride { marker, .. } => Some(marker),
            Self::AlreadyHeld { .. } => None,
        }
    }
}

/// Whether a lock acquired at `acquired_at` is older than `timeout` at `now`.
pub fn is_stale(acquired_at: Timestamp, timeout: Duration, now: Timestamp) -> bool {
    acquired_at.elapsed_until(now) > timeout
}

/// Acquires and releases processing locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn ArtifactStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Tries to take the lock on `item` for `holder`.
    pub async fn try_acquire(
        &self,
        item: &WorkItemRef,
        holder: InvocationId,
    ) -> Result<LockOutcome, StoreError> {
        let now = self.clock.now();
        let marker = LockMarker {
            holder,
            acquired_at: now,
        };

        let current = self.store.read_lock(item).await?;
        if let Some(existing) = &current {
            if !is_stale(existing.acquired_at, self.timeout, now) {
                debug!(work_item = %item, since = %existing.acquired_at, "Lock is held");
                return Ok(LockOutcome::AlreadyHeld {
                    since: existing.acquired_at,
                });
            }
        }

        if !self
            .store
            .compare_and_swap_lock(item, current.as_ref(), Some(&marker))
            .await?
        {
            // Someone else changed the marker between our read and our swap.
            let since = self
                .store
                .read_lock(item)
                .await?
                .map_or(now, |m| m.acquired_at);
            debug!(work_item = %item, "Lost the race for the lock");
            return Ok(LockOutcome::AlreadyHeld { since });
        }

        match current {
            None => Ok(LockOutcome::Acquired(marker)),
            Some(previous) => {
                warn!(
                    work_item = %item,
                    previous_holder = %previous.holder,
                    acquired_at = %previous.acquired_at,
                    "Overriding stale processing lock"
                );
                Ok(LockOutcome::StaleOverride { marker, previous })
            }
        }
    }

    /// Whether `marker` is still the lock on `item`.
    pub async fn is_held(&self, item: &WorkItemRef, marker: &LockMarker) -> Result<bool, StoreError> {
        Ok(self.store.read_lock(item).await?.as_ref() == Some(marker))
    }

    /// Releases the lock if `marker` still holds it. Returns whether it did.
    pub async fn release(&self, item: &WorkItemRef, marker: &LockMarker) -> Result<bool, StoreError> {
        let released = self
            .store
            .compare_and_swap_lock(item, Some(marker), None)
            .await?;
        if !released {
            warn!(work_item = %item, holder = %marker.holder, "Lock was taken over before release");
        }
        Ok(released)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
