//! Transfer engine seam.
//!
//! The wire protocol, peer discovery and piece selection live behind
//! [`TransferEngine`]. The reconciler only ever talks to this trait; each
//! method is a suspension point with unbounded latency (acquiring content
//! from the network may take arbitrarily long) and no built-in timeout.
//!
//! A *handle* is the engine's session for one content id. Handles are
//! addressed by [`ContentId`]; the engine never persists them.

pub mod local;
pub mod magnet;

#[cfg(test)]
pub mod testing;

use crate::core::session::ContentId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use local::{EngineOptions, LocalEngine};

/// What the engine learned about content once a handle is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub content_id: ContentId,
    pub name: String,
    pub size_bytes: Option<u64>,
    /// Self-contained locator for re-acquiring the content later.
    pub descriptor: String,
}

/// Read-only counters of a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngineStats {
    /// Fraction of content held locally, in `[0, 1]`.
    pub progress: f64,
    pub peers: u32,
    pub downloaded: u64,
    pub uploaded: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("engine already holds a session for {0}")]
    AlreadyPresent(ContentId),
    #[error("engine holds no session for {0}")]
    NotHeld(ContentId),
    #[error("content not found at {0}")]
    MissingContent(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Start acquiring content from `descriptor` into `root`.
    async fn add(&self, descriptor: &str, root: &Path) -> Result<ResolvedContent, EngineError>;

    /// Start seeding content already on disk at `path`, announced as `name`.
    async fn seed(&self, path: &Path, name: &str) -> Result<ResolvedContent, EngineError>;

    /// Release the transport for `id`, keeping content on disk.
    async fn pause(&self, id: &ContentId) -> Result<(), EngineError>;

    /// Release `id`; with `destroy_content` also delete its data.
    async fn remove(&self, id: &ContentId, destroy_content: bool) -> Result<(), EngineError>;

    /// Counters of the live handle for `id`, if any.
    fn get(&self, id: &ContentId) -> Option<EngineStats>;

    /// Tear the engine down once every handle has been released.
    async fn shutdown(&self) -> Result<(), EngineError>;
}
