//! Signal-of-Stop: cooperative shutdown token shared by the daemon's tasks.
//!
//! The control server, the persistence ticker and the telemetry task all
//! hold a clone. Cancelling any clone wakes every waiter; waiting on an
//! already-cancelled signal returns immediately.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cloneable stop signal. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    shared: Arc<Shared>,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every holder to stop. Idempotent.
    pub fn cancel(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Resolve once `cancel()` has been called on any clone.
    pub async fn wait(&self) {
        loop {
            // Register interest before re-checking the flag so a cancel that
            // lands in between is not lost.
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Drive `fut` until it completes or the signal fires.
    ///
    /// Returns `None` when the signal won.
    pub async fn run_until<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}
