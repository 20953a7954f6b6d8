//! Ledger: the set of known sessions, keyed by content id.
//!
//! The ledger is the in-memory authority; the file under the data
//! directory is a whole-record snapshot of it written by the
//! [`DurableWriter`](crate::core::durable::DurableWriter). Records keep
//! insertion order, which is also the listing order.
//!
//! Invariant: at most one record per content id. Every mutation re-applies
//! dedup (keeping the first occurrence), so a file that picked up duplicates
//! from an older writer heals on the next persist.

use crate::core::error::LedgerError;
use crate::core::session::{ContentId, Session, StoredSession};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Point-in-time copy of the ledger, tagged with the revision it was taken at.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub revision: u64,
    pub sessions: Vec<Session>,
}

impl LedgerSnapshot {
    /// Canonical on-disk encoding: a pretty JSON array of records.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.sessions)
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    sessions: Vec<Session>,
    revision: u64,
    /// Set when the loaded file was not in canonical form (legacy fields or
    /// duplicate records) and should be rewritten.
    needs_rewrite: bool,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sessions(sessions: Vec<Session>) -> Self {
        let mut ledger = Self {
            sessions,
            revision: 0,
            needs_rewrite: false,
        };
        ledger.needs_rewrite = ledger.dedup() > 0;
        ledger
    }

    /// Restore the ledger from `path`.
    ///
    /// A missing or blank file is an empty ledger. A file that exists but
    /// does not decode is an error: returning an empty or partial set here
    /// would let the next persist overwrite recorded intent.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    event = "ledger_missing",
                    path = %path.display(),
                    "No ledger file, starting empty"
                );
                return Ok(Self::new());
            }
            Err(source) => return Err(LedgerError::io("reading ledger", path, source)),
        };

        if content.trim().is_empty() {
            return Ok(Self::new());
        }

        let stored: Vec<StoredSession> =
            serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        let mut migrated = 0usize;
        let sessions = stored
            .into_iter()
            .map(|record| {
                if record.is_legacy() {
                    migrated += 1;
                }
                record.into_session()
            })
            .collect();

        let mut ledger = Self::from_sessions(sessions);
        if migrated > 0 {
            info!(
                event = "ledger_legacy_migrated",
                records = migrated,
                "Migrated legacy pause flags"
            );
            ledger.needs_rewrite = true;
        }
        info!(
            event = "ledger_loaded",
            sessions = ledger.len(),
            "Ledger loaded"
        );
        Ok(ledger)
    }

    /// Insert `session`, replacing any record with the same content id in
    /// place.
    pub fn upsert(&mut self, session: Session) {
        match self
            .sessions
            .iter_mut()
            .find(|s| s.content_id == session.content_id)
        {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
        self.dedup();
        self.revision += 1;
    }

    /// Remove the record for `id`, returning it.
    pub fn remove(&mut self, id: &ContentId) -> Option<Session> {
        let index = self.sessions.iter().position(|s| &s.content_id == id)?;
        let removed = self.sessions.remove(index);
        self.dedup();
        self.revision += 1;
        Some(removed)
    }

    pub fn find(&self, id: &ContentId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.content_id == id)
    }

    pub fn find_by_descriptor(&self, descriptor: &str) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.descriptor.as_deref() == Some(descriptor))
    }

    /// Defensive copy of every record, in insertion order.
    pub fn all(&self) -> Vec<Session> {
        self.sessions.clone()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            revision: self.revision,
            sessions: self.all(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[cfg(test)]
    pub fn count_in(&self, state: crate::core::session::SessionState) -> usize {
        self.sessions.iter().filter(|s| s.state == state).count()
    }

    pub fn needs_rewrite(&self) -> bool {
        self.needs_rewrite
    }

    /// Drop later records that repeat a content id. Returns how many went.
    fn dedup(&mut self) -> usize {
        let before = self.sessions.len();
        let mut seen = HashSet::with_capacity(before);
        self.sessions.retain(|s| seen.insert(s.content_id.clone()));
        let dropped = before - self.sessions.len();
        if dropped > 0 {
            warn!(
                event = "ledger_dedup",
                dropped,
                "Dropped duplicate ledger records"
            );
        }
        dropped
    }
}
