//! Shutdown signalling for workers.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A cancellation token shared by the worker pool.
///
/// Cloning shares the underlying signal. Cancelling any clone cancels all of
/// them.
///
/// # Examples
///
/// ```rust
/// use mailroom::jobs::CancellationToken;
///
/// # async fn example() {
/// let token = CancellationToken::new();
/// let child = token.clone();
///
/// token.cancel();
/// child.cancelled().await;
/// assert!(child.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancellationState>,
}

#[derive(Debug)]
struct CancellationState {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            state: Arc::new(CancellationState { tx, rx }),
        }
    }

    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.rx.borrow()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        let _ = self.state.tx.send(true);
        debug!("Cancellation requested");
    }

    /// Wait for cancellation. Returns immediately if already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run `future` unless cancellation arrives first.
    ///
    /// Returns `None` when cancelled.
    pub async fn run_until_cancelled<F, T>(&self, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            () = self.cancelled() => None,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// How a worker pool shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownResult {
    /// Every worker finished its in-flight job.
    Graceful,
    /// The grace period ran out; remaining workers were aborted.
    Forced {
        /// Workers still running at the deadline.
        workers_remaining: usize,
    },
}
