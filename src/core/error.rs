use std::path::PathBuf;

use thiserror::Error;

use crate::core::session::ContentId;

/// What a `NotFound` refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    /// No ledger record with this id.
    Session(ContentId),
    /// Nothing on disk at the expected local path.
    LocalContent(PathBuf),
}

/// Failure of a lifecycle or config command.
///
/// Every variant except the engine failures is raised before anything is
/// mutated; the engine variants are raised after the engine refused, with
/// the ledger untouched.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("{}", describe_missing(.0))]
    NotFound(Missing),

    #[error("engine could not add content: {0}")]
    EngineAddFailed(String),

    #[error("engine could not pause {id}: {reason}")]
    PauseFailed { id: ContentId, reason: String },

    #[error("could not resume {id}: {reason}")]
    ResumeFailed { id: ContentId, reason: String },

    #[error("daemon is shutting down")]
    ShuttingDown,
}

fn describe_missing(missing: &Missing) -> String {
    match missing {
        Missing::Session(id) => format!("no session with id {id}"),
        Missing::LocalContent(path) => format!("no local content at {}", path.display()),
    }
}

impl CommandError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn session_not_found(id: &ContentId) -> Self {
        Self::NotFound(Missing::Session(id.clone()))
    }

    /// Stable machine-readable code used by the control protocol.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation_error",
            CommandError::DuplicateSession(_) => "duplicate_session",
            CommandError::NotFound(_) => "not_found",
            CommandError::EngineAddFailed(_) => "engine_add_failed",
            CommandError::PauseFailed { .. } => "pause_failed",
            CommandError::ResumeFailed { .. } => "resume_failed",
            CommandError::ShuttingDown => "shutting_down",
        }
    }
}

/// Failure to load the ledger file.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a complete ledger. Never treated as empty.
    #[error("ledger at {path} is corrupt or truncated: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
