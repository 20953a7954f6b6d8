//! Daemon configuration record (`config.json`) and its store.

use crate::core::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_STORAGE_DIR_NAME, DEFAULT_UTP};
use crate::core::engine::EngineOptions;
use crate::core::error::CommandError;
use crate::utils::atomic_write::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info, warn};

/// User-configurable daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Where content is stored. Always absolute once loaded.
    #[serde(rename = "storageDir", default)]
    pub storage_dir: PathBuf,
    /// Connection limit handed to the engine. Applied on next start.
    #[serde(rename = "maxConns", default = "default_max_connections")]
    pub max_connections: u32,
    /// uTP transport toggle. Applied on next start.
    #[serde(default = "default_utp")]
    pub utp: bool,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_utp() -> bool {
    DEFAULT_UTP
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            utp: DEFAULT_UTP,
        }
    }
}

impl Config {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_connections: self.max_connections,
            utp: self.utp,
        }
    }

    /// Fill defaults and make the storage root absolute.
    fn normalize(mut self) -> Self {
        if self.storage_dir.as_os_str().is_empty()
            || self.storage_dir.to_string_lossy().trim().is_empty()
        {
            self.storage_dir = default_storage_dir();
        } else if self.storage_dir.is_relative() {
            self.storage_dir = absolutize(&self.storage_dir);
        }
        if self.max_connections == 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        self
    }
}

/// Partial update; absent fields are left as they are.
///
/// `max_connections` is signed so negative input reaches validation instead
/// of failing to decode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    #[serde(rename = "storageDir", default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(rename = "maxConns", default)]
    pub max_connections: Option<i64>,
    #[serde(default)]
    pub utp: Option<bool>,
}

/// `<documents>/bitvid-seeder`, falling back to `<home>/Documents`.
pub fn default_storage_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Documents")))
        .unwrap_or_else(|| PathBuf::from("Documents"))
        .join(DEFAULT_STORAGE_DIR_NAME)
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().unwrap_or_default().join(path)
}

pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Config>,
}

impl ConfigStore {
    /// Load `path`, creating it with defaults when absent. An unreadable or
    /// unparseable file is logged and left alone; defaults are used.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(parsed) => {
                    let config = parsed.normalize();
                    write_config(&path, &config);
                    config
                }
                Err(e) => {
                    error!(
                        event = "config_parse_failure",
                        path = %path.display(),
                        error = %e,
                        "Config file unreadable, using defaults"
                    );
                    Config::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    event = "config_created",
                    path = %path.display(),
                    "No config file found, writing defaults"
                );
                let config = Config::default();
                write_config(&path, &config);
                config
            }
            Err(e) => {
                error!(
                    event = "config_read_failure",
                    path = %path.display(),
                    error = %e,
                    "Cannot read config file, using defaults"
                );
                Config::default()
            }
        };

        Self {
            path,
            current: RwLock::new(config),
        }
    }

    /// Store backed by `path` without touching the filesystem.
    #[cfg(test)]
    pub fn with_config(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(config.normalize()),
        }
    }

    pub fn get(&self) -> Config {
        self.read().clone()
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.read().storage_dir.clone()
    }

    /// Validate every supplied field, then apply them together and persist.
    ///
    /// A failed write is logged; the in-memory record still changes.
    pub fn set(&self, patch: ConfigPatch) -> Result<Config, CommandError> {
        let storage_dir = match patch.storage_dir {
            Some(dir) => Some(validate_storage_dir(&dir)?),
            None => None,
        };
        let max_connections = match patch.max_connections {
            Some(n) if n <= 0 => {
                return Err(CommandError::validation(
                    "maxConns must be a positive integer",
                ));
            }
            Some(n) => Some(u32::try_from(n).map_err(|_| {
                CommandError::validation(format!("maxConns must be at most {}", u32::MAX))
            })?),
            None => None,
        };

        let updated = {
            let mut current = self.write();
            let before = current.clone();
            if let Some(dir) = storage_dir {
                current.storage_dir = dir;
            }
            if let Some(n) = max_connections {
                current.max_connections = n;
            }
            if let Some(utp) = patch.utp {
                current.utp = utp;
            }
            if before.max_connections != current.max_connections || before.utp != current.utp {
                info!(
                    event = "config_restart_required",
                    max_connections = current.max_connections,
                    utp = current.utp,
                    "Engine settings changed; they apply on next start"
                );
            }
            current.clone()
        };

        write_config(&self.path, &updated);
        info!(
            event = "config_updated",
            storage_dir = %updated.storage_dir.display(),
            "Config updated"
        );
        Ok(updated)
    }

    fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.current.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Config> {
        self.current.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Absolute, created if missing, writable.
fn validate_storage_dir(dir: &Path) -> Result<PathBuf, CommandError> {
    if dir.as_os_str().is_empty() {
        return Err(CommandError::validation("storageDir must not be empty"));
    }
    if !dir.is_absolute() {
        return Err(CommandError::validation(format!(
            "storageDir must be an absolute path: {}",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir).map_err(|e| {
        CommandError::validation(format!("cannot create {}: {e}", dir.display()))
    })?;

    let probe = dir.join(".seedkeeper-write-probe");
    std::fs::write(&probe, b"").map_err(|e| {
        CommandError::validation(format!("{} is not writable: {e}", dir.display()))
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(dir.to_path_buf())
}

fn write_config(path: &Path, config: &Config) {
    let result = serde_json::to_vec_pretty(config)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| atomic_write(path, &bytes));
    if let Err(e) = result {
        warn!(
            event = "config_write_failure",
            path = %path.display(),
            error = %e,
            "Failed to write config file"
        );
    }
}
