//! Data directory layout.
//!
//! Defaults to `~/.seedkeeper/` and can be overridden with `--data-dir`.
//! Resolved once at startup and handed to every component that touches the
//! filesystem; nothing reads it from a global.

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};

const DEFAULT_DIR_NAME: &str = ".seedkeeper";

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Use `custom` if given, otherwise `~/.seedkeeper`.
    pub fn resolve(custom: Option<&Path>) -> Result<Self> {
        let root = match custom {
            Some(p) => p.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("No home directory found; pass --data-dir"))?
                .join(DEFAULT_DIR_NAME),
        };
        Ok(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the data directory if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating data directory {}", self.root.display()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.root.join("torrents.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("seedkeeper.log")
    }
}
