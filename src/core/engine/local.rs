//! LocalEngine: a transfer engine without a network transport.
//!
//! It keeps the handle table, derives content ids from local bytes and
//! resolves magnet descriptors by parsing them. It never contacts peers, so
//! peer counts and transfer counters stay at zero and progress reflects
//! whether the content is present under the storage root.

use crate::core::engine::{EngineError, EngineStats, ResolvedContent, TransferEngine, magnet};
use crate::core::session::ContentId;
use async_trait::async_trait;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Content ids are the first 20 bytes of the SHA3-256 digest, the length of
/// a v1 info hash.
const CONTENT_ID_LEN: usize = 20;

/// Engine construction parameters taken from the daemon config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub max_connections: u32,
    pub utp: bool,
}

#[derive(Debug, Clone)]
struct LocalHandle {
    path: PathBuf,
}

pub struct LocalEngine {
    handles: Mutex<HashMap<ContentId, LocalHandle>>,
}

impl LocalEngine {
    pub fn new(options: EngineOptions) -> Self {
        info!(
            event = "engine_started",
            max_connections = options.max_connections,
            utp = options.utp,
            "Local transfer engine ready"
        );
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn handle_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ContentId, LocalHandle>> {
        self.handles.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn register(&self, id: &ContentId, path: PathBuf) -> Result<(), EngineError> {
        let mut table = self.table();
        if table.contains_key(id) {
            return Err(EngineError::AlreadyPresent(id.clone()));
        }
        table.insert(id.clone(), LocalHandle { path });
        Ok(())
    }
}

#[async_trait]
impl TransferEngine for LocalEngine {
    async fn add(&self, descriptor: &str, root: &Path) -> Result<ResolvedContent, EngineError> {
        let parsed = magnet::parse(descriptor).map_err(EngineError::InvalidDescriptor)?;
        let name = parsed
            .name
            .clone()
            .unwrap_or_else(|| parsed.content_id.to_string());
        let path = content_path(root, &parsed.content_id, &name);
        let size_bytes = parsed.length.or_else(|| content_size(&path).ok());

        self.register(&parsed.content_id, path)?;
        debug!(
            event = "engine_add",
            content_id = %parsed.content_id,
            name = %name,
            "Handle registered from descriptor"
        );
        Ok(ResolvedContent {
            content_id: parsed.content_id,
            name,
            size_bytes,
            descriptor: descriptor.to_string(),
        })
    }

    async fn seed(&self, path: &Path, name: &str) -> Result<ResolvedContent, EngineError> {
        if !path.exists() {
            return Err(EngineError::MissingContent(path.to_path_buf()));
        }
        let owned = path.to_path_buf();
        let (content_id, size) = tokio::task::spawn_blocking(move || hash_content(&owned))
            .await
            .map_err(|e| EngineError::Other(format!("hashing task failed: {e}")))??;

        self.register(&content_id, path.to_path_buf())?;
        debug!(
            event = "engine_seed",
            content_id = %content_id,
            path = %path.display(),
            "Handle registered from local content"
        );
        Ok(ResolvedContent {
            descriptor: magnet::build(&content_id, name, Some(size)),
            content_id,
            name: name.to_string(),
            size_bytes: Some(size),
        })
    }

    async fn pause(&self, id: &ContentId) -> Result<(), EngineError> {
        self.table()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotHeld(id.clone()))
    }

    async fn remove(&self, id: &ContentId, destroy_content: bool) -> Result<(), EngineError> {
        let handle = self
            .table()
            .remove(id)
            .ok_or_else(|| EngineError::NotHeld(id.clone()))?;
        if destroy_content {
            let path = handle.path;
            tokio::task::spawn_blocking(move || remove_content(&path))
                .await
                .map_err(|e| EngineError::Other(format!("delete task failed: {e}")))??;
        }
        Ok(())
    }

    fn get(&self, id: &ContentId) -> Option<EngineStats> {
        let path = self.table().get(id)?.path.clone();
        Some(EngineStats {
            progress: if path.exists() { 1.0 } else { 0.0 },
            ..EngineStats::default()
        })
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let dropped = {
            let mut table = self.table();
            let n = table.len();
            table.clear();
            n
        };
        info!(
            event = "engine_stopped",
            dropped_handles = dropped,
            "Local transfer engine stopped"
        );
        Ok(())
    }
}

/// True when `name` is exactly one normal path component.
pub fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Where content named `name` lives under `root`. Names that are not a
/// single path component fall back to the content id.
pub fn content_path(root: &Path, id: &ContentId, name: &str) -> PathBuf {
    if is_single_component(name) {
        root.join(name)
    } else {
        root.join(id.as_str())
    }
}

/// Delete a file or directory tree. Already gone counts as success.
pub fn remove_content(path: &Path) -> Result<(), EngineError> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EngineError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn content_size(path: &Path) -> Result<u64, EngineError> {
    let meta = std::fs::metadata(path).map_err(io_err(path))?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for file in list_files(path)? {
        total += std::fs::metadata(&file).map_err(io_err(&file))?.len();
    }
    Ok(total)
}

/// Content id and total size of a file or directory tree.
///
/// Directories hash every file in sorted relative-path order, with the path
/// mixed in, so renames inside the tree change the id.
fn hash_content(path: &Path) -> Result<(ContentId, u64), EngineError> {
    let mut hasher = Sha3_256::new();
    let mut size = 0u64;

    if std::fs::metadata(path).map_err(io_err(path))?.is_dir() {
        for file in list_files(path)? {
            let relative = file.strip_prefix(path).unwrap_or(&file);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            size += hash_file(&file, &mut hasher)?;
        }
    } else {
        size = hash_file(path, &mut hasher)?;
    }

    let digest = hasher.finalize();
    Ok((ContentId::from_bytes(&digest[..CONTENT_ID_LEN]), size))
}

fn hash_file(path: &Path, hasher: &mut Sha3_256) -> Result<u64, EngineError> {
    let mut file = File::open(path).map_err(io_err(path))?;
    std::io::copy(&mut file, hasher).map_err(io_err(path))
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).map_err(io_err(&current))? {
            let entry = entry.map_err(io_err(&current))?;
            let path = entry.path();
            if entry.file_type().map_err(io_err(&path))?.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
