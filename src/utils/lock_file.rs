//! Advisory cross-process lock files.
//!
//! A lock is a sidecar file holding the owner's PID. It is published by
//! writing the PID to a private staging file, syncing it, and hard-linking
//! it into place, so a lock file never exists without a complete PID. A
//! lock whose owner is no longer running is stale and gets reclaimed. The
//! returned [`LockGuard`] deletes the file on drop, so the lock is released
//! on every exit path, including early returns and unwinding.
//!
//! Reclaiming happens under a second, short-lived claim file
//! (`<lock>.claim`). Only the claim holder may delete a stale lock, and
//! only if the lock still holds the bytes that were judged stale. A
//! competing process that published in the meantime keeps its lock.
//!
//! These locks only coordinate with other processes that follow the same
//! protocol (a second daemon pointed at the same data directory, a stale
//! instance that is still shutting down). In-process callers must
//! serialize among themselves.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Age after which a lock or claim without a readable PID is abandoned.
/// Locks published here always carry a PID; empty ones come from a crash
/// on a filesystem that lost the write, or from foreign tools.
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by live process {pid}")]
    Held { path: PathBuf, pid: u32 },
    #[error("lock {path} still busy after {attempts} attempts")]
    Busy { path: PathBuf, attempts: u32 },
    #[error("I/O error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

#[cfg(test)]
impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                event = "lock_release_failure",
                path = %self.path.display(),
                error = %e,
                "Failed to remove lock file"
            );
        }
    }
}

/// Lock path guarding `target`: `<target>.lock`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    with_suffix(target, ".lock")
}

/// Who currently owns an existing lock file.
#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Live(u32),
    /// Dead owner, or unreadable and past the grace period. Carries the
    /// exact bytes that were judged stale.
    Stale(Vec<u8>),
    /// Deleted between the failed publish and the inspection.
    Vanished,
}

/// Make one attempt at taking the lock, reclaiming it if stale.
pub fn try_lock(lock_path: &Path) -> Result<LockGuard, LockError> {
    let my_pid = std::process::id();

    match publish(lock_path, my_pid) {
        Ok(()) => return Ok(guard(lock_path)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(source) => return Err(io_error(lock_path, source)),
    }

    match inspect(lock_path, my_pid).map_err(|e| io_error(lock_path, e))? {
        Holder::Live(pid) => {
            return Err(LockError::Held {
                path: lock_path.to_path_buf(),
                pid,
            });
        }
        Holder::Stale(seen) => reclaim(lock_path, &seen, my_pid)?,
        Holder::Vanished => {}
    }

    match publish(lock_path, my_pid) {
        Ok(()) => Ok(guard(lock_path)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LockError::Held {
            path: lock_path.to_path_buf(),
            pid: read_pid(lock_path).unwrap_or(0),
        }),
        Err(source) => Err(io_error(lock_path, source)),
    }
}

/// Take the lock, sleeping `retry_delay` between attempts while another
/// live process holds it.
pub async fn acquire(
    lock_path: &Path,
    attempts: u32,
    retry_delay: Duration,
) -> Result<LockGuard, LockError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match try_lock(lock_path) {
            Ok(guard) => return Ok(guard),
            Err(LockError::Held { pid, .. }) => {
                debug!(
                    event = "lock_busy",
                    path = %lock_path.display(),
                    pid,
                    attempt,
                    "Lock busy, retrying"
                );
                if attempt < attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(LockError::Busy {
        path: lock_path.to_path_buf(),
        attempts,
    })
}

fn guard(lock_path: &Path) -> LockGuard {
    LockGuard {
        path: lock_path.to_path_buf(),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Create `path` holding `pid`, failing with `AlreadyExists` if it exists.
fn publish(path: &Path, pid: u32) -> std::io::Result<()> {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let staging = with_suffix(path, &format!(".{pid}.{seq}.tmp"));
    let linked = write_pid(&staging, pid).and_then(|()| std::fs::hard_link(&staging, path));
    let _ = std::fs::remove_file(&staging);
    linked
}

fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    write!(file, "{pid}")?;
    file.sync_all()
}

fn inspect(lock_path: &Path, my_pid: u32) -> std::io::Result<Holder> {
    let contents = match std::fs::read(lock_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Holder::Vanished),
        Err(e) => return Err(e),
    };
    match parse_pid(&contents) {
        Some(pid) if pid != my_pid && is_pid_alive(pid) => Ok(Holder::Live(pid)),
        // Dead owner, or our own PID left behind by an earlier process that
        // had the same PID. In-process holders never reach this point
        // concurrently.
        Some(pid) => {
            debug!(
                event = "lock_stale",
                path = %lock_path.display(),
                pid,
                "Stale lock found"
            );
            Ok(Holder::Stale(contents))
        }
        None if age(lock_path) < UNREADABLE_GRACE => Ok(Holder::Live(0)),
        None => {
            debug!(
                event = "lock_unreadable",
                path = %lock_path.display(),
                "Abandoned lock without a PID found"
            );
            Ok(Holder::Stale(contents))
        }
    }
}

/// Delete the lock at `lock_path` if it still holds `seen`. Fails with
/// `Held` while another process is reclaiming.
fn reclaim(lock_path: &Path, seen: &[u8], my_pid: u32) -> Result<(), LockError> {
    let claim_path = with_suffix(lock_path, ".claim");
    let claim = match publish(&claim_path, my_pid) {
        Ok(()) => guard(&claim_path),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let pid = read_pid(&claim_path).unwrap_or(0);
            clear_abandoned_claim(&claim_path);
            return Err(LockError::Held {
                path: lock_path.to_path_buf(),
                pid,
            });
        }
        Err(source) => return Err(io_error(&claim_path, source)),
    };

    match std::fs::read(lock_path) {
        Ok(current) if current == seen => match std::fs::remove_file(lock_path) {
            Ok(()) => {
                debug!(event = "lock_reclaimed", path = %lock_path.display(), "Stale lock removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(lock_path, source)),
        },
        // Replaced since inspection; the next publish decides.
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(io_error(lock_path, source)),
    }
    drop(claim);
    Ok(())
}

/// A claim is held for two file operations. One that outlives the grace
/// period belongs to a reclaimer that died mid-way.
fn clear_abandoned_claim(claim_path: &Path) {
    if age(claim_path) < UNREADABLE_GRACE {
        return;
    }
    match std::fs::remove_file(claim_path) {
        Ok(()) => warn!(
            event = "lock_claim_abandoned",
            path = %claim_path.display(),
            "Removed abandoned lock claim"
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            event = "lock_claim_abandoned",
            path = %claim_path.display(),
            error = %e,
            "Failed to remove abandoned lock claim"
        ),
    }
}

/// Time since the last modification. Unknown or future times count as
/// fresh.
fn age(path: &Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or(Duration::ZERO)
}

fn parse_pid(contents: &[u8]) -> Option<u32> {
    std::str::from_utf8(contents).ok()?.trim().parse().ok()
}

fn read_pid(path: &Path) -> Option<u32> {
    parse_pid(&std::fs::read(path).ok()?)
}

#[cfg(windows)]
fn is_pid_alive(pid: u32) -> bool {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x08000000;

    std::process::Command::new("tasklist")
        .creation_flags(CREATE_NO_WINDOW)
        .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&format!("\"{pid}\"")))
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn is_pid_alive(pid: u32) -> bool {
    if Path::new("/proc").is_dir() {
        return Path::new("/proc").join(pid.to_string()).exists();
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
