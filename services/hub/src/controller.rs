//! Shared controller plumbing: the error taxonomy, bounded conflict
//! retries, and the reconcile driver loop.
//!
//! Each controller owns one kind and processes one key at a time from a
//! coalescing queue. Failures requeue with exponential backoff; invariant
//! violations and user errors are surfaced in object status instead of
//! being retried tightly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_store::{HubStore, StoreError, StoreEvent};

use crate::queue::CoalescingQueue;

/// Bounded attempts for optimistic-concurrency writes.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Result type for reconcile operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// The error taxonomy of §7: each kind carries its own retry policy.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Store conflicts, not-found races, decode retries. Requeued with
    /// backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Invariant violation in input (bad subindex, missing tracking label).
    /// Recorded, surfaced in status, not retried tightly.
    #[error("unexpected behavior: {0}")]
    UnexpectedBehavior(String),

    /// Malformed override or conflicting patch. Re-evaluated on the next
    /// spec change.
    #[error("user error: {0}")]
    UserError(String),

    /// Scheduler misconfiguration; the leader crash-loops.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        ControllerError::Transient(err.to_string())
    }
}

impl ControllerError {
    /// Whether the driver should requeue the key with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControllerError::Transient(_))
    }
}

/// Run a read-modify-write against the store, retrying on conflict up to
/// [`MAX_CONFLICT_RETRIES`] times. The closure re-reads and re-merges on
/// every attempt.
pub async fn with_conflict_retry<T, F, Fut>(mut op: F) -> ControllerResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                attempt += 1;
                if attempt >= MAX_CONFLICT_RETRIES {
                    return Err(ControllerError::Transient(format!(
                        "conflict retry budget exhausted: {err}"
                    )));
                }
                debug!(attempt, error = %err, "Write conflict, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// A reconciler drives one kind of object toward its desired state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name, used in logs.
    fn name(&self) -> &'static str;

    /// Map a store event to the queue keys this reconciler cares about.
    /// Returning an empty list ignores the event.
    async fn map_event(&self, event: &StoreEvent) -> Vec<String>;

    /// Keys to enqueue on a periodic resync pass.
    async fn resync_keys(&self) -> Vec<String>;

    /// Process one key. At most one reconcile per key is in flight.
    async fn reconcile(&self, key: &str) -> ControllerResult<()>;
}

/// Per-key exponential backoff, reset on success.
struct Backoff {
    attempts: HashMap<String, u32>,
}

impl Backoff {
    fn new() -> Self {
        Self {
            attempts: HashMap::new(),
        }
    }

    fn next_delay(&mut self, key: &str) -> Duration {
        let attempt = self.attempts.entry(key.to_string()).or_insert(0);
        *attempt += 1;
        let exp = (*attempt - 1).min(16);
        let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
        delay.min(BACKOFF_CAP)
    }

    fn reset(&mut self, key: &str) {
        self.attempts.remove(key);
    }
}

/// Drive a reconciler until shutdown: pump store events into its queue,
/// tick a resync interval, and process keys one at a time.
pub async fn run_controller<R: Reconciler>(
    reconciler: Arc<R>,
    store: Arc<HubStore>,
    resync_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = reconciler.name();
    info!(controller = name, "Starting controller");

    let queue = Arc::new(CoalescingQueue::new());
    let mut events = store.subscribe();
    let mut resync = tokio::time::interval(resync_interval);
    let mut backoff = Backoff::new();

    loop {
        // Drain all ready work before waiting on events again.
        while let Some(key) = queue.try_next() {
            match reconciler.reconcile(&key).await {
                Ok(()) => {
                    backoff.reset(&key);
                    queue.done(&key);
                }
                Err(err) if err.is_retryable() => {
                    let delay = backoff.next_delay(&key);
                    warn!(
                        controller = name,
                        key = %key,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Reconcile failed, requeueing"
                    );
                    queue.done(&key);
                    queue.requeue_after(&key, delay);
                }
                Err(err) => {
                    error!(controller = name, key = %key, error = %err, "Reconcile failed");
                    queue.done(&key);
                }
            }
        }

        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        for key in reconciler.map_event(&event).await {
                            queue.add(&key);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(controller = name, skipped, "Watch lagged, resyncing");
                        for key in reconciler.resync_keys().await {
                            queue.add(&key);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!(controller = name, "Store watch closed, stopping");
                        break;
                    }
                }
            }
            _ = resync.tick() => {
                for key in reconciler.resync_keys().await {
                    queue.add(&key);
                }
            }
            _ = queue.ready() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(controller = name, "Controller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_conflict_retry_succeeds_within_budget() {
        let mut failures = 2;
        let result = with_conflict_retry(|| {
            let fail = failures > 0;
            if fail {
                failures -= 1;
            }
            async move {
                if fail {
                    Err(StoreError::Conflict {
                        kind: "Test",
                        key: "k".to_string(),
                        given: 1,
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_conflict_retry_exhausts() {
        let result: ControllerResult<()> = with_conflict_retry(|| async {
            Err(StoreError::Conflict {
                kind: "Test",
                key: "k".to_string(),
                given: 1,
            })
        })
        .await;
        assert!(matches!(result, Err(ControllerError::Transient(_))));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let mut calls = 0;
        let result: ControllerResult<()> = with_conflict_retry(|| {
            calls += 1;
            async {
                Err(StoreError::NotFound {
                    kind: "Test",
                    key: "k".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay("key");
        let second = backoff.next_delay("key");
        assert!(second > first);

        backoff.reset("key");
        assert_eq!(backoff.next_delay("key"), first);
    }

    #[test]
    fn test_backoff_caps() {
        let mut backoff = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_delay("key");
        }
        assert_eq!(last, BACKOFF_CAP);
    }
}
