//! Cooperative cancellation (spec §5, §9).
//!
//! The donor's `control::JobControl` registers one `Arc<AtomicBool>` per
//! running job and polls it from the download loop. This engine has a
//! richer cancellation surface — a batch inside the segmented-download loop
//! can be cancelled either by the user (pause/cancel) or by the engine
//! itself to force a resegmentation (spec §4.4.2) — so cancellation is
//! modeled on `tokio_util::sync::CancellationToken`, and `pendingResegment`
//! is carried alongside it to disambiguate the two triggers, exactly as
//! spec §5 requires ("the `pendingResegment` field disambiguates a
//! resegmentation cancellation from an external one").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Per-task cancellation handle. Cloning shares the same underlying token.
#[derive(Debug, Clone)]
pub struct TaskCancellation {
    token: CancellationToken,
}

impl TaskCancellation {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A child token for one batch attempt, cancelled either when the parent
    /// is cancelled (external pause/cancel) or independently (resegmentation).
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for TaskCancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutable mid-flight cell watched by the segmented-download loop's
/// watcher subtask (spec §4.4.2) and written by the coordinator's
/// `setTaskConnections` (spec §4.5). `0` means "no change pending".
#[derive(Clone)]
pub struct MaxConnectionsCell {
    tx: Arc<watch::Sender<usize>>,
}

pub struct MaxConnectionsWatcher {
    rx: watch::Receiver<usize>,
}

impl MaxConnectionsCell {
    pub fn new(initial: usize) -> (Self, MaxConnectionsWatcher) {
        let (tx, rx) = watch::channel(initial);
        (
            MaxConnectionsCell { tx: Arc::new(tx) },
            MaxConnectionsWatcher { rx },
        )
    }

    pub fn get(&self) -> usize {
        *self.tx.borrow()
    }

    pub fn set(&self, value: usize) {
        let _ = self.tx.send(value);
    }
}

impl MaxConnectionsWatcher {
    /// Suspends until a new positive value different from `current` appears
    /// (spec §4.4.2 watcher subtask contract).
    pub async fn wait_for_change(&mut self, current: usize) -> usize {
        loop {
            if self.rx.changed().await.is_err() {
                // Sender dropped: never resolves further; suspend forever so
                // `select!` falls through to the other branch.
                std::future::pending::<()>().await;
            }
            let candidate = *self.rx.borrow();
            if candidate > 0 && candidate != current {
                return candidate;
            }
        }
    }
}

/// Disambiguates a watcher-triggered resegmentation cancellation from an
/// external pause/cancel (spec §5, §9). Set by the watcher immediately
/// before it cancels the batch token; read by the outer loop after the
/// batch future resolves.
#[derive(Clone, Default)]
pub struct PendingResegment {
    requested: Arc<AtomicUsize>,
}

impl PendingResegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, connection_count: usize) {
        self.requested.store(connection_count, Ordering::SeqCst);
    }

    /// Takes the pending value, if any, resetting it to "none".
    pub fn take(&self) -> Option<usize> {
        let value = self.requested.swap(0, Ordering::SeqCst);
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }

    /// Reads the pending value without resetting it. Used to disambiguate a
    /// resegmentation-triggered batch cancellation from an external one
    /// (spec §5, §9) before the outer loop consumes it with `take`.
    pub fn peek(&self) -> Option<usize> {
        let value = self.requested.load(Ordering::SeqCst);
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn max_connections_watcher_ignores_equal_and_zero_values() {
        let (cell, mut watcher) = MaxConnectionsCell::new(4);
        cell.set(4);
        cell.set(0);
        cell.set(2);
        let got = watcher.wait_for_change(4).await;
        assert_eq!(got, 2);
    }

    #[test]
    fn pending_resegment_roundtrip() {
        let p = PendingResegment::new();
        assert_eq!(p.take(), None);
        p.set(3);
        assert_eq!(p.take(), Some(3));
        assert_eq!(p.take(), None);
    }

    #[tokio::test]
    async fn task_cancellation_child_tokens_cancel_with_parent() {
        let parent = TaskCancellation::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_token_cancels_independently_of_parent() {
        let parent = TaskCancellation::new();
        let child = parent.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
