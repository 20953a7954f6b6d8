//! Scripted engine double for reconciler tests: records every call and
//! fails on demand, delegating the rest to a [`LocalEngine`].

use super::{
    EngineError, EngineOptions, EngineStats, LocalEngine, ResolvedContent, TransferEngine,
};
use crate::core::session::ContentId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String),
    Seed(PathBuf),
    Pause(ContentId),
    Remove(ContentId, bool),
    Shutdown,
}

pub struct ScriptedEngine {
    inner: LocalEngine,
    calls: Mutex<Vec<Call>>,
    pub fail_add: AtomicBool,
    pub fail_seed: AtomicBool,
    pub fail_pause: AtomicBool,
    pub fail_remove: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            inner: LocalEngine::new(EngineOptions {
                max_connections: 10,
                utp: false,
            }),
            calls: Mutex::new(Vec::new()),
            fail_add: AtomicBool::new(false),
            fail_seed: AtomicBool::new(false),
            fail_pause: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    /// Make every engine call sleep first, widening race windows.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn handle_count(&self) -> usize {
        self.inner.handle_count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pace(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<(), EngineError> {
        if flag.load(Ordering::SeqCst) {
            return Err(EngineError::Other(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    async fn add(&self, descriptor: &str, root: &Path) -> Result<ResolvedContent, EngineError> {
        self.record(Call::Add(descriptor.to_string()));
        self.pace().await;
        Self::injected(&self.fail_add, "add")?;
        self.inner.add(descriptor, root).await
    }

    async fn seed(&self, path: &Path, name: &str) -> Result<ResolvedContent, EngineError> {
        self.record(Call::Seed(path.to_path_buf()));
        self.pace().await;
        Self::injected(&self.fail_seed, "seed")?;
        self.inner.seed(path, name).await
    }

    async fn pause(&self, id: &ContentId) -> Result<(), EngineError> {
        self.record(Call::Pause(id.clone()));
        self.pace().await;
        Self::injected(&self.fail_pause, "pause")?;
        self.inner.pause(id).await
    }

    async fn remove(&self, id: &ContentId, destroy_content: bool) -> Result<(), EngineError> {
        self.record(Call::Remove(id.clone(), destroy_content));
        self.pace().await;
        Self::injected(&self.fail_remove, "remove")?;
        self.inner.remove(id, destroy_content).await
    }

    fn get(&self, id: &ContentId) -> Option<EngineStats> {
        self.inner.get(id)
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.record(Call::Shutdown);
        self.inner.shutdown().await
    }
}
