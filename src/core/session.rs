//! Session records: one per piece of content the daemon knows about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Content identifier ───────────────────────────────────────────────────────

/// Stable identifier derived from content (an info hash, lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Parse a user-supplied id: non-empty ASCII hex, normalized to lowercase.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Lifecycle state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Should hold a live engine handle.
    #[default]
    Active,
    /// Content kept on disk, no engine handle.
    Paused,
}

// ── Session record ───────────────────────────────────────────────────────────

/// Canonical session record, as written to the ledger file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "infoHash")]
    pub content_id: ContentId,
    /// Locator the engine can re-acquire the content from.
    #[serde(rename = "magnet", default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    /// Display name; also the content's file or directory name under the
    /// storage root.
    pub name: String,
    pub state: SessionState,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(
        rename = "dateAdded",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_added: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_paused(&self) -> bool {
        self.state == SessionState::Paused
    }
}

/// On-disk shape accepted by the loader: the canonical fields plus the
/// legacy boolean `paused` flag written by older releases.
#[derive(Debug, Deserialize)]
pub(crate) struct StoredSession {
    #[serde(rename = "infoHash")]
    content_id: ContentId,
    #[serde(rename = "magnet", default)]
    descriptor: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: Option<SessionState>,
    #[serde(default)]
    paused: Option<bool>,
    #[serde(rename = "size", default)]
    size_bytes: Option<u64>,
    #[serde(rename = "dateAdded", default)]
    date_added: Option<DateTime<Utc>>,
}

impl StoredSession {
    /// True when the record still carries the legacy `paused` flag.
    pub(crate) fn is_legacy(&self) -> bool {
        self.paused.is_some()
    }

    /// Normalize to the canonical record. An explicit `state` wins over the
    /// legacy flag; neither present means active.
    pub(crate) fn into_session(self) -> Session {
        let state = match (self.state, self.paused) {
            (Some(state), _) => state,
            (None, Some(true)) => SessionState::Paused,
            (None, Some(false)) | (None, None) => SessionState::Active,
        };
        Session {
            content_id: self.content_id,
            descriptor: self.descriptor.filter(|d| !d.is_empty()),
            name: self.name,
            state,
            size_bytes: self.size_bytes,
            date_added: self.date_added,
        }
    }
}
