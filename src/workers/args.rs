//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{DEFAULT_CONTROL_PORT, PERSIST_INTERVAL};
use crate::core::durable::PersistPolicy;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// When ledger changes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// Every command waits for its write.
    #[default]
    Immediate,
    /// Writes are batched once per interval.
    Debounced,
}

#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about = "seedkeeper - durable seeding daemon")]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Path to a config file (TOML)
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory for persistent data (config.json, torrents.json, logs).
    /// Defaults to ~/.seedkeeper/
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Loopback TCP port of the control socket.
    #[clap(short, long, default_value_t = DEFAULT_CONTROL_PORT)]
    pub port: u16,

    /// Ledger persistence policy.
    #[clap(long, value_enum, default_value_t = PersistMode::Immediate)]
    pub persist: PersistMode,

    /// Batch interval of the debounced policy, in seconds.
    #[clap(long, default_value_t = PERSIST_INTERVAL.as_secs())]
    pub persist_interval_secs: u64,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            data_dir: None,
            port: DEFAULT_CONTROL_PORT,
            persist: PersistMode::Immediate,
            persist_interval_secs: PERSIST_INTERVAL.as_secs(),
            verbose: 0,
        }
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        Self::resolve(Args::parse())
    }

    /// Merge `cli` over `--config`, or over `./config.toml` when no file is
    /// named. A named file that is missing or malformed is an error.
    pub fn resolve(cli: Args) -> Result<Self> {
        let mut cli = cli;
        cli.data_dir = cli.data_dir.map(Self::resolve_path);

        if let Some(config_path) = &cli.config {
            let file = Self::from_file(config_path)?;
            return Ok(Self::merge(file, cli));
        }

        let default_path = PathBuf::from("config.toml");
        if default_path.exists()
            && let Ok(file) = Self::from_file(&default_path)
        {
            return Ok(Self::merge(file, cli));
        }

        Ok(cli)
    }

    pub fn persist_policy(&self) -> PersistPolicy {
        match self.persist {
            PersistMode::Immediate => PersistPolicy::Immediate,
            PersistMode::Debounced => {
                PersistPolicy::Debounced(Duration::from_secs(self.persist_interval_secs.max(1)))
            }
        }
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut args = toml::from_str::<Args>(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        args.data_dir = args.data_dir.map(Self::resolve_path);
        Ok(args)
    }

    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.data_dir.is_some() {
            file.data_dir = cli.data_dir;
        }
        if cli.port != DEFAULT_CONTROL_PORT {
            file.port = cli.port;
        }
        if cli.persist != PersistMode::default() {
            file.persist = cli.persist;
        }
        if cli.persist_interval_secs != PERSIST_INTERVAL.as_secs() {
            file.persist_interval_secs = cli.persist_interval_secs;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        file.config = cli.config;
        file
    }
}
