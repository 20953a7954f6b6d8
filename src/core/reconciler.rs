//! Reconciler: the only path through which sessions change.
//!
//! It owns the ledger and the set of content ids holding a live engine
//! handle, and keeps the two consistent with the engine:
//! - a live handle always has a ledger record;
//! - a Paused record never has a live handle once a command returns;
//! - the ledger changes only after the engine call it depends on succeeded.
//!
//! Locking:
//! - one FIFO async mutex per content id orders lifecycle commands for that
//!   id in issuance order, across engine suspension points;
//! - a short-held state mutex covers the ledger, the live set and the
//!   in-flight add reservations. It is never held across an `.await`;
//! - a gate (read side per command, write side on close) lets shutdown wait
//!   for in-flight commands before handles are released.

use crate::core::config::{DESCRIPTOR_PREFIX, IMPORT_READY_ATTEMPTS, IMPORT_READY_DELAY};
use crate::core::durable::DurableWriter;
use crate::core::engine::local::{content_path, is_single_component, remove_content};
use crate::core::engine::{EngineError, ResolvedContent, TransferEngine};
use crate::core::error::{CommandError, Missing};
use crate::core::ledger::{Ledger, LedgerSnapshot};
use crate::core::session::{ContentId, Session, SessionState};
use crate::core::settings::ConfigStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

struct State {
    ledger: Ledger,
    live: HashSet<ContentId>,
    /// Adds whose engine call is still in flight, by descriptor or path.
    pending: HashSet<String>,
}

/// Outcome of startup replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub restored: usize,
    pub paused: usize,
    /// Active records left without a handle; they stay in the ledger.
    pub unrecoverable: Vec<ContentId>,
}

/// Read-only view of one record for status projection.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: Session,
    pub live: bool,
}

pub struct Reconciler {
    engine: Arc<dyn TransferEngine>,
    writer: Arc<DurableWriter>,
    config: Arc<ConfigStore>,
    state: StdMutex<State>,
    id_locks: StdMutex<HashMap<ContentId, Arc<Mutex<()>>>>,
    gate: RwLock<()>,
    closed: AtomicBool,
}

/// Turn on one content id's command queue. Dropping it hands the turn to
/// the next waiter, and forgets the queue once nobody else is on it.
struct IdTurn<'a> {
    owner: &'a Reconciler,
    id: ContentId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdTurn<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.id_locks();
        drop(self.guard.take());
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

/// Reservation of an add key; released on drop.
struct Reservation<'a> {
    owner: &'a Reconciler,
    key: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.owner.state().pending.remove(&self.key);
    }
}

enum Admission {
    Admitted(Session, LedgerSnapshot),
    Duplicate { existing: Session, live: bool },
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        writer: Arc<DurableWriter>,
        config: Arc<ConfigStore>,
        ledger: Ledger,
    ) -> Self {
        Self {
            engine,
            writer,
            config,
            state: StdMutex::new(State {
                ledger,
                live: HashSet::new(),
                pending: HashSet::new(),
            }),
            id_locks: StdMutex::new(HashMap::new()),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<dyn TransferEngine> {
        &self.engine
    }

    // ── Lifecycle commands ───────────────────────────────────────────────────

    /// Add a session from a magnet descriptor.
    pub async fn add_by_descriptor(&self, descriptor: &str) -> Result<Session, CommandError> {
        let _permit = self.begin().await?;
        let descriptor = descriptor.trim();
        validate_descriptor(descriptor)?;

        let _reservation =
            self.reserve(descriptor, |ledger| ledger.find_by_descriptor(descriptor).is_some())?;
        let root = self.config.storage_dir();
        let resolved = self
            .engine
            .add(descriptor, &root)
            .await
            .map_err(|e| self.add_failure(e))?;
        self.admit(resolved).await
    }

    /// Add a session for content already at `<storage root>/<name>`.
    pub async fn add_local(&self, name: &str) -> Result<Session, CommandError> {
        let _permit = self.begin().await?;
        self.add_local_unguarded(name).await
    }

    /// Copy `source` into the storage root as `name`, then add it as local
    /// content. The copy is removed again if the add fails.
    pub async fn import_local_file(
        &self,
        source: &Path,
        name: &str,
    ) -> Result<Session, CommandError> {
        let _permit = self.begin().await?;
        let root = self.config.storage_dir();
        let target = local_path(&root, name).ok_or_else(|| invalid_name(name))?;

        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|_| CommandError::NotFound(Missing::LocalContent(source.to_path_buf())))?;
        if !meta.is_file() {
            return Err(CommandError::validation(format!(
                "import source is not a regular file: {}",
                source.display()
            )));
        }
        if tokio::fs::try_exists(&target).await.unwrap_or(true) {
            return Err(CommandError::validation(format!(
                "{name} already exists in the storage directory"
            )));
        }

        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            CommandError::EngineAddFailed(format!("preparing {}: {e}", root.display()))
        })?;
        tokio::fs::copy(source, &target).await.map_err(|e| {
            CommandError::EngineAddFailed(format!("copying {}: {e}", source.display()))
        })?;
        info!(
            event = "import_copied",
            source = %source.display(),
            target = %target.display(),
            bytes = meta.len(),
            "Imported file into storage"
        );

        let added = match wait_readable(&target).await {
            Ok(()) => self.add_local_unguarded(name).await,
            Err(e) => Err(CommandError::EngineAddFailed(format!(
                "{} never became readable: {e}",
                target.display()
            ))),
        };
        if added.is_err()
            && let Err(e) = tokio::fs::remove_file(&target).await
        {
            warn!(
                event = "import_cleanup_failure",
                path = %target.display(),
                error = %e,
                "Failed to remove imported copy"
            );
        }
        added
    }

    /// Release the live handle (keeping content) and mark the record Paused.
    pub async fn pause(&self, id: &ContentId) -> Result<Session, CommandError> {
        let _permit = self.begin().await?;
        let _order = self.lock_id(id).await;
        let (record, live) = self.lookup(id)?;

        if record.is_paused() && !live {
            debug!(event = "pause_noop", content_id = %id, "Session already paused");
            return Ok(record);
        }

        if live {
            match self.engine.pause(id).await {
                Ok(()) => {}
                Err(EngineError::NotHeld(_)) => {
                    debug!(
                        event = "pause_not_held",
                        content_id = %id,
                        "Engine held no handle"
                    );
                }
                Err(e) => {
                    warn!(event = "pause_failure", content_id = %id, error = %e, "Engine pause failed");
                    return Err(CommandError::PauseFailed {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let (session, snapshot) = {
            let mut state = self.state();
            state.live.remove(id);
            let mut session = record;
            session.state = SessionState::Paused;
            state.ledger.upsert(session.clone());
            (session, state.ledger.snapshot())
        };
        self.writer.submit(snapshot).await;
        info!(event = "session_paused", content_id = %id, "Session paused");
        Ok(session)
    }

    /// Re-establish a handle when there is none and mark the record Active.
    pub async fn resume(&self, id: &ContentId) -> Result<Session, CommandError> {
        let _permit = self.begin().await?;
        let _order = self.lock_id(id).await;
        let (record, live) = self.lookup(id)?;

        if live && !record.is_paused() {
            debug!(event = "resume_noop", content_id = %id, "Session already active");
            return Ok(record);
        }

        let mut resolved = None;
        if !live {
            let root = self.config.storage_dir();
            resolved = self
                .reestablish(&record, &root)
                .await
                .map_err(|reason| CommandError::ResumeFailed {
                    id: id.clone(),
                    reason,
                })?;
        }

        let (session, snapshot) = {
            let mut state = self.state();
            state.live.insert(id.clone());
            let mut session = record;
            session.state = SessionState::Active;
            if session.size_bytes.is_none() {
                session.size_bytes = resolved.and_then(|r| r.size_bytes);
            }
            state.ledger.upsert(session.clone());
            (session, state.ledger.snapshot())
        };
        self.writer.submit(snapshot).await;
        info!(event = "session_resumed", content_id = %id, "Session resumed");
        Ok(session)
    }

    /// Destroy the handle, drop the record and delete the content.
    ///
    /// Engine and storage cleanup failures are logged; the record goes
    /// regardless.
    pub async fn remove(&self, id: &ContentId) -> Result<Session, CommandError> {
        let _permit = self.begin().await?;
        let _order = self.lock_id(id).await;
        let (record, live) = self.lookup(id)?;

        if live && let Err(e) = self.engine.remove(id, true).await {
            warn!(
                event = "remove_engine_failure",
                content_id = %id,
                error = %e,
                "Engine remove failed; dropping the record anyway"
            );
        }

        let (snapshot, name_shared) = {
            let mut state = self.state();
            state.live.remove(id);
            state.ledger.remove(id);
            let shared = state.ledger.all().iter().any(|s| s.name == record.name);
            (state.ledger.snapshot(), shared)
        };
        self.writer.submit(snapshot).await;

        let root = self.config.storage_dir();
        if !name_shared && let Some(path) = local_path(&root, &record.name) {
            let cleanup = tokio::task::spawn_blocking(move || remove_content(&path)).await;
            match cleanup {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    event = "remove_cleanup_failure",
                    content_id = %id,
                    error = %e,
                    "Residual content could not be deleted"
                ),
                Err(e) => warn!(
                    event = "remove_cleanup_failure",
                    content_id = %id,
                    error = %e,
                    "Cleanup task failed"
                ),
            }
        }

        info!(event = "session_removed", content_id = %id, "Session removed");
        Ok(record)
    }

    // ── Startup / shutdown ───────────────────────────────────────────────────

    /// Re-establish handles for every Active record. Runs once, before
    /// commands are served. Records that cannot be restored stay in the
    /// ledger without a handle.
    pub async fn replay(&self) -> ReplayReport {
        let root = self.config.storage_dir();
        let (sessions, needs_rewrite) = {
            let state = self.state();
            (state.ledger.all(), state.ledger.needs_rewrite())
        };

        let mut report = ReplayReport::default();
        for record in sessions {
            if record.is_paused() {
                report.paused += 1;
                continue;
            }
            let id = record.content_id.clone();
            let _order = self.lock_id(&id).await;
            match self.reestablish(&record, &root).await {
                Ok(_) => {
                    self.state().live.insert(id);
                    report.restored += 1;
                }
                Err(reason) => {
                    error!(
                        event = "replay_unrecoverable",
                        content_id = %id,
                        name = %record.name,
                        reason = %reason,
                        "Session cannot be restored; left in the ledger"
                    );
                    report.unrecoverable.push(id);
                }
            }
        }

        if needs_rewrite {
            let snapshot = self.state().ledger.snapshot();
            self.writer.submit(snapshot).await;
        }
        info!(
            event = "replay_complete",
            restored = report.restored,
            paused = report.paused,
            unrecoverable = report.unrecoverable.len(),
            "Ledger replayed"
        );
        report
    }

    /// Stop accepting commands and wait for in-flight ones to finish.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _drained = self.gate.write().await;
        info!(event = "reconciler_closed", "No longer accepting commands");
    }

    /// Gracefully release every live handle. Records keep their state, so
    /// the next start restores the same set.
    pub async fn release_all(&self) -> usize {
        let live: Vec<ContentId> = self.state().live.drain().collect();
        let mut released = 0;
        for id in live {
            match self.engine.pause(&id).await {
                Ok(()) | Err(EngineError::NotHeld(_)) => released += 1,
                Err(e) => warn!(
                    event = "release_failure",
                    content_id = %id,
                    error = %e,
                    "Failed to release handle"
                ),
            }
        }
        info!(event = "handles_released", released, "Live handles released");
        released
    }

    // ── Read access ──────────────────────────────────────────────────────────

    /// Every record with its liveness, in ledger order, from one consistent
    /// view.
    pub fn sessions(&self) -> Vec<SessionView> {
        let state = self.state();
        state
            .ledger
            .all()
            .into_iter()
            .map(|session| SessionView {
                live: state.live.contains(&session.content_id),
                session,
            })
            .collect()
    }

    /// Path of a session's content under the current storage root.
    pub fn locate(&self, id: &ContentId) -> Result<PathBuf, CommandError> {
        let record = self
            .find(id)
            .ok_or_else(|| CommandError::session_not_found(id))?;
        let path = content_path(&self.config.storage_dir(), id, &record.name);
        if !path.exists() {
            return Err(CommandError::NotFound(Missing::LocalContent(path)));
        }
        Ok(path)
    }

    pub fn find(&self, id: &ContentId) -> Option<Session> {
        self.state().ledger.find(id).cloned()
    }

    #[cfg(test)]
    pub fn is_live(&self, id: &ContentId) -> bool {
        self.state().live.contains(id)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn begin(&self) -> Result<RwLockReadGuard<'_, ()>, CommandError> {
        let permit = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::ShuttingDown);
        }
        Ok(permit)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn id_locks(&self) -> MutexGuard<'_, HashMap<ContentId, Arc<Mutex<()>>>> {
        self.id_locks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Wait for this id's turn. Waiters and the holder each keep a clone of
    /// the queue's `Arc`, so a map entry with a single owner is idle.
    async fn lock_id(&self, id: &ContentId) -> IdTurn<'_> {
        let lock = Arc::clone(self.id_locks().entry(id.clone()).or_default());
        let guard = lock.lock_owned().await;
        IdTurn {
            owner: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn queued_ids(&self) -> usize {
        self.id_locks().len()
    }

    fn lookup(&self, id: &ContentId) -> Result<(Session, bool), CommandError> {
        let state = self.state();
        let record = state
            .ledger
            .find(id)
            .cloned()
            .ok_or_else(|| CommandError::session_not_found(id))?;
        Ok((record, state.live.contains(id)))
    }

    fn reserve(
        &self,
        key: &str,
        recorded: impl FnOnce(&Ledger) -> bool,
    ) -> Result<Reservation<'_>, CommandError> {
        let mut state = self.state();
        if recorded(&state.ledger) || !state.pending.insert(key.to_string()) {
            return Err(CommandError::DuplicateSession(key.to_string()));
        }
        Ok(Reservation {
            owner: self,
            key: key.to_string(),
        })
    }

    fn add_failure(&self, err: EngineError) -> CommandError {
        match err {
            EngineError::AlreadyPresent(id) => {
                let recorded = self.state().ledger.find(&id).is_some();
                if recorded {
                    CommandError::DuplicateSession(id.to_string())
                } else {
                    CommandError::EngineAddFailed(format!("engine already holds {id}"))
                }
            }
            EngineError::MissingContent(path) => CommandError::NotFound(Missing::LocalContent(path)),
            other => CommandError::EngineAddFailed(other.to_string()),
        }
    }

    async fn add_local_unguarded(&self, name: &str) -> Result<Session, CommandError> {
        let root = self.config.storage_dir();
        let path = local_path(&root, name).ok_or_else(|| invalid_name(name))?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(CommandError::NotFound(Missing::LocalContent(path)));
        }

        let key = path.to_string_lossy().into_owned();
        let _reservation = self.reserve(&key, |_| false)?;
        let resolved = self
            .engine
            .seed(&path, name)
            .await
            .map_err(|e| self.add_failure(e))?;
        self.admit(resolved).await
    }

    /// Record a freshly created handle as a new Active session.
    async fn admit(&self, resolved: ResolvedContent) -> Result<Session, CommandError> {
        let id = resolved.content_id.clone();
        let _order = self.lock_id(&id).await;

        let admission = {
            let mut state = self.state();
            match state.ledger.find(&id).cloned() {
                Some(existing) => Admission::Duplicate {
                    live: state.live.contains(&id),
                    existing,
                },
                None => {
                    let session = Session {
                        content_id: id.clone(),
                        descriptor: Some(resolved.descriptor),
                        name: resolved.name,
                        state: SessionState::Active,
                        size_bytes: resolved.size_bytes,
                        date_added: Some(Utc::now()),
                    };
                    state.ledger.upsert(session.clone());
                    state.live.insert(id.clone());
                    Admission::Admitted(session, state.ledger.snapshot())
                }
            }
        };

        match admission {
            Admission::Admitted(session, snapshot) => {
                self.writer.submit(snapshot).await;
                info!(
                    event = "session_added",
                    content_id = %id,
                    name = %session.name,
                    "Session added"
                );
                Ok(session)
            }
            Admission::Duplicate { existing, live } => {
                if existing.is_paused() {
                    if let Err(e) = self.engine.pause(&id).await {
                        warn!(
                            event = "duplicate_release_failure",
                            content_id = %id,
                            error = %e,
                            "Failed to release handle of a paused session"
                        );
                    }
                } else if !live {
                    self.state().live.insert(id.clone());
                    info!(
                        event = "session_handle_adopted",
                        content_id = %id,
                        "Active session without a handle adopted the new one"
                    );
                }
                Err(CommandError::DuplicateSession(id.to_string()))
            }
        }
    }

    /// Establish a handle for `record`: seed from local content when it is
    /// present, otherwise re-acquire from the descriptor. `None` means the
    /// engine already held a handle for this id.
    async fn reestablish(
        &self,
        record: &Session,
        root: &Path,
    ) -> Result<Option<ResolvedContent>, String> {
        let local = local_path(root, &record.name).filter(|p| p.exists());

        let attempt = match (&local, record.descriptor.as_deref()) {
            (Some(path), descriptor) => match self.engine.seed(path, &record.name).await {
                Err(e) if !matches!(e, EngineError::AlreadyPresent(_)) && descriptor.is_some() => {
                    warn!(
                        event = "reacquire_seed_failure",
                        content_id = %record.content_id,
                        error = %e,
                        "Seeding local content failed, falling back to descriptor"
                    );
                    self.engine.add(descriptor.unwrap_or_default(), root).await
                }
                other => other,
            },
            (None, Some(descriptor)) => self.engine.add(descriptor, root).await,
            (None, None) => {
                return Err(format!(
                    "local content {:?} is missing and no descriptor is recorded",
                    record.name
                ));
            }
        };

        match attempt {
            Ok(resolved) if resolved.content_id == record.content_id => Ok(Some(resolved)),
            Ok(resolved) => {
                if let Err(e) = self.engine.pause(&resolved.content_id).await {
                    warn!(
                        event = "stray_release_failure",
                        content_id = %resolved.content_id,
                        error = %e,
                        "Failed to release mismatched handle"
                    );
                }
                Err(format!(
                    "content resolved to {} instead of {}",
                    resolved.content_id, record.content_id
                ))
            }
            Err(EngineError::AlreadyPresent(held)) if held == record.content_id => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn validate_descriptor(descriptor: &str) -> Result<(), CommandError> {
    if descriptor.is_empty() {
        return Err(CommandError::validation("descriptor must not be empty"));
    }
    if !descriptor.starts_with(DESCRIPTOR_PREFIX) {
        return Err(CommandError::validation(format!(
            "descriptor must start with {DESCRIPTOR_PREFIX}"
        )));
    }
    Ok(())
}

fn invalid_name(name: &str) -> CommandError {
    CommandError::validation(format!("{name:?} is not a plain file or directory name"))
}

/// `<root>/<name>` when `name` is a single normal path component.
fn local_path(root: &Path, name: &str) -> Option<PathBuf> {
    is_single_component(name).then(|| root.join(name))
}

async fn wait_readable(path: &Path) -> std::io::Result<()> {
    let mut attempt = 1;
    loop {
        match tokio::fs::File::open(path).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt >= IMPORT_READY_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!(
                    event = "import_not_ready",
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "Imported file not readable yet"
                );
                attempt += 1;
                tokio::time::sleep(IMPORT_READY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::durable::PersistPolicy;
    use crate::core::engine::testing::{Call, ScriptedEngine};
    use crate::core::engine::{EngineOptions, LocalEngine};
    use crate::core::settings::Config;
    use std::time::Duration;
    use tempfile::TempDir;

    const MAGNET_A: &str = "magnet:?xt=urn:btih:aa01&dn=clip.mp4";

    struct Harness {
        _dir: TempDir,
        storage: PathBuf,
        ledger_path: PathBuf,
        engine: Arc<ScriptedEngine>,
        reconciler: Arc<Reconciler>,
    }

    fn harness() -> Harness {
        harness_with(|_| Ledger::new())
    }

    fn harness_with(ledger: impl FnOnce(&Path) -> Ledger) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        let ledger_path = dir.path().join("torrents.json");

        let config = Arc::new(ConfigStore::with_config(
            dir.path().join("config.json"),
            Config {
                storage_dir: storage.clone(),
                max_connections: 10,
                utp: false,
            },
        ));
        let writer = Arc::new(DurableWriter::new(&ledger_path, PersistPolicy::Immediate));
        let engine = Arc::new(ScriptedEngine::new());
        let reconciler = Arc::new(Reconciler::new(
            engine.clone(),
            writer,
            config,
            ledger(&storage),
        ));
        Harness {
            _dir: dir,
            storage,
            ledger_path,
            engine,
            reconciler,
        }
    }

    fn on_disk(path: &Path) -> Vec<Session> {
        Ledger::load(path).unwrap().all()
    }

    fn record(id: &str, name: &str, descriptor: Option<&str>, state: SessionState) -> Session {
        Session {
            content_id: ContentId::parse(id).unwrap(),
            descriptor: descriptor.map(str::to_string),
            name: name.to_string(),
            state,
            size_bytes: None,
            date_added: None,
        }
    }

    async fn content_id_of(path: &Path) -> ContentId {
        let engine = LocalEngine::new(EngineOptions {
            max_connections: 1,
            utp: false,
        });
        engine.seed(path, "sample").await.unwrap().content_id
    }

    #[tokio::test]
    async fn add_then_identical_add_is_duplicate() {
        let h = harness();
        let session = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap();
        assert_eq!(session.content_id.as_str(), "aa01");
        assert_eq!(session.state, SessionState::Active);
        assert!(session.date_added.is_some());
        assert!(h.reconciler.is_live(&session.content_id));
        assert_eq!(on_disk(&h.ledger_path), vec![session.clone()]);

        let err = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap_err();
        assert_eq!(err.code(), "duplicate_session");
        assert_eq!(h.reconciler.sessions().len(), 1);
    }

    #[tokio::test]
    async fn different_descriptor_same_content_is_duplicate() {
        let h = harness();
        h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap();
        let err = h
            .reconciler
            .add_by_descriptor("magnet:?xt=urn:btih:AA01&dn=renamed.mp4")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_session");
        assert_eq!(h.reconciler.sessions().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_adds_admit_one() {
        let h = harness();
        h.engine.set_delay(Some(Duration::from_millis(30)));
        let (a, b) = tokio::join!(
            h.reconciler.add_by_descriptor(MAGNET_A),
            h.reconciler.add_by_descriptor(MAGNET_A)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let err = a.err().or(b.err()).unwrap();
        assert_eq!(err.code(), "duplicate_session");
        assert_eq!(h.engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn malformed_descriptor_never_reaches_engine() {
        let h = harness();
        for bad in ["", "   ", "http://example.com/file.torrent"] {
            let err = h.reconciler.add_by_descriptor(bad).await.unwrap_err();
            assert_eq!(err.code(), "validation_error");
        }
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn engine_add_failure_leaves_ledger_untouched() {
        let h = harness();
        ScriptedEngine::fail(&h.engine.fail_add, true);
        let err = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap_err();
        assert_eq!(err.code(), "engine_add_failed");
        assert!(h.reconciler.sessions().is_empty());
        assert!(!h.ledger_path.exists());

        // The reservation is released, so a retry goes through.
        ScriptedEngine::fail(&h.engine.fail_add, false);
        assert!(h.reconciler.add_by_descriptor(MAGNET_A).await.is_ok());
    }

    #[tokio::test]
    async fn pause_is_idempotent() {
        let h = harness();
        let session = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap();
        let id = session.content_id;

        let paused = h.reconciler.pause(&id).await.unwrap();
        assert_eq!(paused.state, SessionState::Paused);
        assert!(!h.reconciler.is_live(&id));
        let file_after_first = std::fs::read(&h.ledger_path).unwrap();

        let again = h.reconciler.pause(&id).await.unwrap();
        assert_eq!(again, paused);
        assert_eq!(std::fs::read(&h.ledger_path).unwrap(), file_after_first);

        let pauses = h
            .engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Pause(_)))
            .count();
        assert_eq!(pauses, 1);
    }

    #[tokio::test]
    async fn failed_engine_pause_keeps_session_active() {
        let h = harness();
        let id = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap().content_id;
        ScriptedEngine::fail(&h.engine.fail_pause, true);

        let err = h.reconciler.pause(&id).await.unwrap_err();
        assert_eq!(err.code(), "pause_failed");
        assert_eq!(h.reconciler.find(&id).unwrap().state, SessionState::Active);
        assert!(h.reconciler.is_live(&id));
    }

    #[tokio::test]
    async fn resume_reacquires_by_descriptor_without_local_content() {
        let h = harness();
        let id = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap().content_id;
        h.reconciler.pause(&id).await.unwrap();
        h.engine.clear_calls();

        let resumed = h.reconciler.resume(&id).await.unwrap();
        assert_eq!(resumed.state, SessionState::Active);
        assert!(h.reconciler.is_live(&id));
        assert_eq!(h.engine.calls(), vec![Call::Add(MAGNET_A.to_string())]);
        assert_eq!(on_disk(&h.ledger_path)[0].state, SessionState::Active);
    }

    #[tokio::test]
    async fn resume_prefers_local_content() {
        let h = harness();
        let path = h.storage.join("talk.webm");
        std::fs::write(&path, b"recorded talk").unwrap();
        let id = h.reconciler.add_local("talk.webm").await.unwrap().content_id;
        h.reconciler.pause(&id).await.unwrap();
        h.engine.clear_calls();

        h.reconciler.resume(&id).await.unwrap();
        assert_eq!(h.engine.calls(), vec![Call::Seed(path)]);
    }

    #[tokio::test]
    async fn resume_of_live_session_is_noop() {
        let h = harness();
        let id = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap().content_id;
        h.engine.clear_calls();
        h.reconciler.resume(&id).await.unwrap();
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_with_changed_content_fails_and_releases_stray_handle() {
        let h = harness();
        let path = h.storage.join("doc.pdf");
        std::fs::write(&path, b"v1").unwrap();
        let id = h.reconciler.add_local("doc.pdf").await.unwrap().content_id;
        h.reconciler.pause(&id).await.unwrap();
        std::fs::write(&path, b"v2").unwrap();

        let err = h.reconciler.resume(&id).await.unwrap_err();
        assert_eq!(err.code(), "resume_failed");
        assert_eq!(h.engine.handle_count(), 0);
        assert_eq!(h.reconciler.find(&id).unwrap().state, SessionState::Paused);
    }

    #[tokio::test]
    async fn commands_on_unknown_id_are_not_found() {
        let h = harness();
        h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap();
        let before = std::fs::read(&h.ledger_path).unwrap();
        let ghost = ContentId::parse("ffff").unwrap();

        assert_eq!(h.reconciler.remove(&ghost).await.unwrap_err().code(), "not_found");
        assert_eq!(h.reconciler.pause(&ghost).await.unwrap_err().code(), "not_found");
        assert_eq!(h.reconciler.resume(&ghost).await.unwrap_err().code(), "not_found");
        assert_eq!(std::fs::read(&h.ledger_path).unwrap(), before);
        assert_eq!(h.reconciler.sessions().len(), 1);
    }

    #[tokio::test]
    async fn remove_destroys_handle_record_and_content() {
        let h = harness();
        let path = h.storage.join("song.ogg");
        std::fs::write(&path, b"la la").unwrap();
        let id = h.reconciler.add_local("song.ogg").await.unwrap().content_id;

        h.reconciler.remove(&id).await.unwrap();
        assert!(!path.exists());
        assert!(h.reconciler.sessions().is_empty());
        assert!(on_disk(&h.ledger_path).is_empty());
        assert!(h.engine.calls().contains(&Call::Remove(id, true)));
    }

    #[tokio::test]
    async fn remove_survives_engine_failure() {
        let h = harness();
        let path = h.storage.join("song.ogg");
        std::fs::write(&path, b"la la").unwrap();
        let id = h.reconciler.add_local("song.ogg").await.unwrap().content_id;
        ScriptedEngine::fail(&h.engine.fail_remove, true);

        h.reconciler.remove(&id).await.unwrap();
        assert!(h.reconciler.find(&id).is_none());
        assert!(!h.reconciler.is_live(&id));
        assert!(!path.exists(), "residual content is cleaned up");
    }

    #[tokio::test]
    async fn remove_of_paused_session_deletes_content() {
        let h = harness();
        let path = h.storage.join("notes.txt");
        std::fs::write(&path, b"notes").unwrap();
        let id = h.reconciler.add_local("notes.txt").await.unwrap().content_id;
        h.reconciler.pause(&id).await.unwrap();

        h.reconciler.remove(&id).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn commands_on_one_id_apply_in_issuance_order() {
        let h = harness();
        let id = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap().content_id;
        h.engine.set_delay(Some(Duration::from_millis(20)));

        let spawn = |op: &'static str| {
            let reconciler = Arc::clone(&h.reconciler);
            let id = id.clone();
            tokio::spawn(async move {
                match op {
                    "pause" => reconciler.pause(&id).await.map(|_| ()),
                    "resume" => reconciler.resume(&id).await.map(|_| ()),
                    _ => reconciler.remove(&id).await.map(|_| ()),
                }
            })
        };
        let pause = spawn("pause");
        tokio::task::yield_now().await;
        let resume = spawn("resume");
        tokio::task::yield_now().await;
        let remove = spawn("remove");

        pause.await.unwrap().unwrap();
        resume.await.unwrap().unwrap();
        remove.await.unwrap().unwrap();

        assert!(h.reconciler.find(&id).is_none());
        assert_eq!(h.engine.handle_count(), 0);
        let order: Vec<_> = h
            .engine
            .calls()
            .into_iter()
            .skip(1)
            .map(|c| match c {
                Call::Pause(_) => "pause",
                Call::Add(_) => "add",
                Call::Remove(..) => "remove",
                _ => "other",
            })
            .collect();
        assert_eq!(order, vec!["pause", "add", "remove"]);
        assert_eq!(h.reconciler.queued_ids(), 0);
    }

    #[tokio::test]
    async fn locate_resolves_content_under_storage() {
        let h = harness();
        std::fs::write(h.storage.join("talk.webm"), b"frames").unwrap();
        let local = h.reconciler.add_local("talk.webm").await.unwrap();
        assert_eq!(
            h.reconciler.locate(&local.content_id).unwrap(),
            h.storage.join("talk.webm")
        );

        // Recorded, but nothing downloaded yet.
        let remote = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap();
        match h.reconciler.locate(&remote.content_id) {
            Err(CommandError::NotFound(Missing::LocalContent(path))) => {
                assert_eq!(path, h.storage.join("clip.mp4"));
            }
            other => panic!("expected missing content, got {other:?}"),
        }

        let unknown = ContentId::parse("dead").unwrap();
        assert!(matches!(
            h.reconciler.locate(&unknown),
            Err(CommandError::NotFound(Missing::Session(_)))
        ));
    }

    #[tokio::test]
    async fn idle_command_queues_are_forgotten() {
        let h = harness();
        let id = h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap().content_id;
        h.reconciler.pause(&id).await.unwrap();
        h.reconciler.resume(&id).await.unwrap();
        for raw in ["dead01", "dead02", "dead03"] {
            let unknown = ContentId::parse(raw).unwrap();
            assert!(h.reconciler.pause(&unknown).await.is_err());
        }
        assert_eq!(h.reconciler.queued_ids(), 0);

        h.engine.set_delay(Some(Duration::from_millis(50)));
        let reconciler = Arc::clone(&h.reconciler);
        let pending = {
            let id = id.clone();
            tokio::spawn(async move { reconciler.pause(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.reconciler.queued_ids(), 1, "in-flight command keeps its queue");

        pending.await.unwrap().unwrap();
        h.reconciler.remove(&id).await.unwrap();
        assert_eq!(h.reconciler.queued_ids(), 0);
    }

    #[tokio::test]
    async fn replay_seeds_from_local_content() {
        let dir = tempfile::tempdir().unwrap();
        let sample = dir.path().join("lecture.mp4");
        std::fs::write(&sample, b"lecture bytes").unwrap();
        let id = content_id_of(&sample).await;

        let descriptor = format!("magnet:?xt=urn:btih:{id}&dn=lecture.mp4");
        let h = harness_with(|storage| {
            std::fs::write(storage.join("lecture.mp4"), b"lecture bytes").unwrap();
            Ledger::from_sessions(vec![record(
                id.as_str(),
                "lecture.mp4",
                Some(descriptor.as_str()),
                SessionState::Active,
            )])
        });

        let report = h.reconciler.replay().await;
        assert_eq!(report.restored, 1);
        assert!(h.reconciler.is_live(&id));
        assert_eq!(
            h.engine.calls(),
            vec![Call::Seed(h.storage.join("lecture.mp4"))]
        );
    }

    #[tokio::test]
    async fn replay_leaves_unrecoverable_and_paused_records_handleless() {
        let h = harness_with(|_| {
            Ledger::from_sessions(vec![
                record("0a", "lost.bin", None, SessionState::Active),
                record("0b", "held.bin", Some("magnet:?xt=urn:btih:0b"), SessionState::Paused),
                record("0c", "fetch.bin", Some("magnet:?xt=urn:btih:0c"), SessionState::Active),
            ])
        });

        let report = h.reconciler.replay().await;
        assert_eq!(report.restored, 1);
        assert_eq!(report.paused, 1);
        assert_eq!(report.unrecoverable, vec![ContentId::parse("0a").unwrap()]);

        let views = h.reconciler.sessions();
        assert_eq!(views.len(), 3, "unrecoverable records are kept");
        let live: Vec<_> = views.iter().filter(|v| v.live).map(|v| v.session.name.clone()).collect();
        assert_eq!(live, vec!["fetch.bin".to_string()]);
        assert_eq!(
            h.engine.calls(),
            vec![Call::Add("magnet:?xt=urn:btih:0c".to_string())]
        );
    }

    #[tokio::test]
    async fn replay_rewrites_legacy_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("legacy.json");
        std::fs::write(
            &legacy,
            r#"[{"infoHash":"0d","name":"x.bin","paused":true}]"#,
        )
        .unwrap();
        let ledger = Ledger::load(&legacy).unwrap();

        let h = harness_with(|_| ledger);
        h.reconciler.replay().await;
        let raw = std::fs::read_to_string(&h.ledger_path).unwrap();
        assert!(raw.contains(r#""state": "paused""#));
        assert!(!raw.contains("\"paused\":"));
    }

    #[tokio::test]
    async fn add_local_requires_existing_plain_name() {
        let h = harness();
        let err = h.reconciler.add_local("missing.bin").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::NotFound(Missing::LocalContent(_))
        ));
        let err = h.reconciler.add_local("../escape.bin").await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn import_copies_into_storage_and_seeds() {
        let h = harness();
        let outside = tempfile::tempdir().unwrap();
        let source = outside.path().join("upload.mp4");
        std::fs::write(&source, b"uploaded video").unwrap();

        let session = h
            .reconciler
            .import_local_file(&source, "video.mp4")
            .await
            .unwrap();
        assert_eq!(session.name, "video.mp4");
        assert_eq!(session.size_bytes, Some(14));
        assert!(h.storage.join("video.mp4").exists());
        assert!(source.exists());
        assert!(h.reconciler.is_live(&session.content_id));
    }

    #[tokio::test]
    async fn failed_import_removes_the_copy() {
        let h = harness();
        let outside = tempfile::tempdir().unwrap();
        let source = outside.path().join("upload.mp4");
        std::fs::write(&source, b"uploaded video").unwrap();
        ScriptedEngine::fail(&h.engine.fail_seed, true);

        let err = h
            .reconciler
            .import_local_file(&source, "video.mp4")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine_add_failed");
        assert!(!h.storage.join("video.mp4").exists());

        let err = h
            .reconciler
            .import_local_file(&outside.path().join("nope"), "x.mp4")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn close_rejects_commands_and_release_all_keeps_records() {
        let h = harness();
        h.reconciler.add_by_descriptor(MAGNET_A).await.unwrap();
        h.reconciler
            .add_by_descriptor("magnet:?xt=urn:btih:bb02")
            .await
            .unwrap();

        h.reconciler.close().await;
        let err = h
            .reconciler
            .add_by_descriptor("magnet:?xt=urn:btih:cc03")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "shutting_down");

        assert_eq!(h.reconciler.release_all().await, 2);
        assert_eq!(h.engine.handle_count(), 0);
        assert!(
            h.reconciler
                .sessions()
                .iter()
                .all(|v| !v.live && v.session.state == SessionState::Active)
        );
    }
}
