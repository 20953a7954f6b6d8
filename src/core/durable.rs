//! DurableWriter: crash-safe persistence of ledger snapshots.
//!
//! Every write replaces the whole ledger file through
//! [`atomic_write`](crate::utils::atomic_write::atomic_write), under
//! two layers of mutual exclusion:
//! - an async mutex serializing writers inside this process;
//! - an advisory lock file next to the ledger (`torrents.json.lock`)
//!   serializing against other processes using the same data directory.
//!
//! Snapshots carry the ledger revision they were taken at. A snapshot older
//! than the last one written is skipped, so racing commands can finish their
//! writes in any order without regressing the file.
//!
//! Write failures never propagate to commands. The failed snapshot is kept
//! as pending and retried by the ticker; a newer snapshot supersedes it.

use crate::core::config::{LOCK_ATTEMPTS, LOCK_RETRY_DELAY};
use crate::core::ledger::LedgerSnapshot;
use crate::utils::atomic_write::atomic_write;
use crate::utils::lock_file::{self, lock_path_for};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// When mutations reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Each command waits for its snapshot to be written. A crash loses at
    /// most the command in flight; every mutation costs a write.
    Immediate,
    /// Commands only mark the ledger dirty; the ticker writes the newest
    /// snapshot once per interval. A crash can lose up to one interval of
    /// changes; bursts cost a single write.
    Debounced(Duration),
}

impl PersistPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            PersistPolicy::Immediate => "immediate",
            PersistPolicy::Debounced(_) => "debounced",
        }
    }
}

/// Result of a single persist call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written,
    /// A snapshot at this revision or newer is already on disk.
    Superseded,
}

pub struct DurableWriter {
    path: PathBuf,
    lock_path: PathBuf,
    policy: PersistPolicy,
    lock_attempts: u32,
    lock_retry_delay: Duration,
    /// Highest revision known to be on disk.
    written: Mutex<Option<u64>>,
    /// Newest snapshot not yet on disk.
    pending: StdMutex<Option<LedgerSnapshot>>,
}

impl DurableWriter {
    pub fn new(path: impl Into<PathBuf>, policy: PersistPolicy) -> Self {
        let path = path.into();
        Self {
            lock_path: lock_path_for(&path),
            path,
            policy,
            lock_attempts: LOCK_ATTEMPTS,
            lock_retry_delay: LOCK_RETRY_DELAY,
            written: Mutex::new(None),
            pending: StdMutex::new(None),
        }
    }

    /// Override how long a write waits for a foreign lock holder.
    #[cfg(test)]
    pub fn with_lock_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.lock_attempts = attempts;
        self.lock_retry_delay = delay;
        self
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    /// Hand a post-mutation snapshot to the writer according to the policy.
    ///
    /// Never fails: under [`PersistPolicy::Immediate`] a failed write is
    /// logged and left pending for the ticker.
    pub async fn submit(&self, snapshot: LedgerSnapshot) {
        match self.policy {
            PersistPolicy::Debounced(_) => {
                debug!(
                    event = "ledger_marked_dirty",
                    revision = snapshot.revision,
                    "Ledger change queued"
                );
                self.stash(snapshot);
            }
            PersistPolicy::Immediate => {
                let revision = snapshot.revision;
                if let Err(e) = self.persist(snapshot.clone()).await {
                    warn!(
                        event = "ledger_persist_failure",
                        revision,
                        error = %format!("{e:#}"),
                        "Ledger write failed; will retry"
                    );
                    self.stash(snapshot);
                }
            }
        }
    }

    /// Write `snapshot` to disk now.
    pub async fn persist(&self, snapshot: LedgerSnapshot) -> Result<PersistOutcome> {
        let mut written = self.written.lock().await;
        if let Some(on_disk) = *written
            && snapshot.revision <= on_disk
        {
            return Ok(PersistOutcome::Superseded);
        }

        let bytes = snapshot.encode().context("encoding ledger snapshot")?;
        let guard = lock_file::acquire(&self.lock_path, self.lock_attempts, self.lock_retry_delay)
            .await
            .context("acquiring ledger lock")?;

        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| anyhow!("ledger write task failed: {e}"));
        drop(guard);
        result??;

        *written = Some(snapshot.revision);
        self.clear_pending_up_to(snapshot.revision);
        debug!(
            event = "ledger_persisted",
            revision = snapshot.revision,
            sessions = snapshot.sessions.len(),
            "Ledger written"
        );
        Ok(PersistOutcome::Written)
    }

    /// Write the pending snapshot, if any. On failure it stays pending.
    pub async fn flush(&self) -> Result<()> {
        let Some(snapshot) = self.take_pending() else {
            return Ok(());
        };
        let revision = snapshot.revision;
        match self.persist(snapshot.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.stash(snapshot);
                Err(e).with_context(|| format!("flushing ledger revision {revision}"))
            }
        }
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.pending_slot().is_some()
    }

    /// Run the persistence tick until `sos` fires.
    pub fn spawn_ticker(self: &Arc<Self>, sos: SignalOfStop) -> JoinHandle<()> {
        let writer = Arc::clone(self);
        let period = match self.policy {
            PersistPolicy::Debounced(interval) => interval,
            PersistPolicy::Immediate => crate::core::config::PERSIST_INTERVAL,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if sos.run_until(ticker.tick()).await.is_none() {
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!(
                        event = "ledger_tick_failure",
                        error = %format!("{e:#}"),
                        "Periodic ledger write failed; will retry"
                    );
                }
            }
            info!(event = "ledger_ticker_stopped", "Persistence ticker stopped");
        })
    }

    fn pending_slot(&self) -> std::sync::MutexGuard<'_, Option<LedgerSnapshot>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Keep the newer of `snapshot` and whatever is already pending.
    fn stash(&self, snapshot: LedgerSnapshot) {
        let mut slot = self.pending_slot();
        let newer = slot
            .as_ref()
            .is_none_or(|current| snapshot.revision >= current.revision);
        if newer {
            *slot = Some(snapshot);
        }
    }

    fn take_pending(&self) -> Option<LedgerSnapshot> {
        self.pending_slot().take()
    }

    fn clear_pending_up_to(&self, revision: u64) {
        let mut slot = self.pending_slot();
        if slot.as_ref().is_some_and(|p| p.revision <= revision) {
            *slot = None;
        }
    }
}
