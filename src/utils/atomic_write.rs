//! Whole-file replace for persisted state (ledger, config).
//!
//! Invariants:
//! - Content goes to `<name>.tmp` next to the target, is flushed and
//!   fsynced, then renamed over the target. Readers see the old file or
//!   the new file, never a prefix of the new one.
//! - On unix the parent directory is fsynced after the rename so the new
//!   directory entry survives power loss.
//! - On any failure the temp file is removed; the target is untouched.
//! - Parent directories are created if absent.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::error;

/// Sibling temp path used while writing `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `content`.
///
/// # Errors
/// Fails if the temp file cannot be written and synced or the rename fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let tmp_path = temp_path_for(path);

    if let Err(e) = write_synced(&tmp_path, content) {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("writing {}", tmp_path.display()));
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("replacing {}", path.display()));
    }

    sync_parent(path);
    Ok(())
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.flush()?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    let dir = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(
            event = "atomic_dir_sync_failure",
            dir = %dir.display(),
            error = %e,
            "Directory fsync failed"
        );
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
