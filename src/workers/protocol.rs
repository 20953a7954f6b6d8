//! Control socket wire format: one JSON object per line in each direction.

use crate::core::error::CommandError;
use crate::core::session::Session;
use crate::core::settings::{Config, ConfigPatch};
use crate::core::status::Page;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    /// Add by magnet descriptor.
    Add {
        magnet: String,
    },
    /// Add content already in the storage directory.
    AddLocal {
        name: String,
    },
    /// Copy a file into the storage directory and add it. `name` defaults
    /// to the source file name.
    Import {
        source: PathBuf,
        #[serde(default)]
        name: Option<String>,
    },
    Pause {
        #[serde(alias = "infoHash")]
        info_hash: String,
    },
    Resume {
        #[serde(alias = "infoHash")]
        info_hash: String,
    },
    Remove {
        #[serde(alias = "infoHash")]
        info_hash: String,
    },
    /// Path of a session's content in the storage directory.
    Locate {
        #[serde(alias = "infoHash")]
        info_hash: String,
    },
    List {
        #[serde(default)]
        page: Option<usize>,
        #[serde(default, alias = "pageSize")]
        page_size: Option<usize>,
    },
    GetConfig,
    SetConfig {
        #[serde(default, rename = "storageDir", alias = "storage_dir")]
        storage_dir: Option<PathBuf>,
        #[serde(default, rename = "maxConns", alias = "max_conns")]
        max_connections: Option<i64>,
        #[serde(default)]
        utp: Option<bool>,
    },
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Add { .. } => "add",
            Request::AddLocal { .. } => "add_local",
            Request::Import { .. } => "import",
            Request::Pause { .. } => "pause",
            Request::Resume { .. } => "resume",
            Request::Remove { .. } => "remove",
            Request::Locate { .. } => "locate",
            Request::List { .. } => "list",
            Request::GetConfig => "get_config",
            Request::SetConfig { .. } => "set_config",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Convert the `set_config` fields into a store patch.
pub fn config_patch(
    storage_dir: Option<PathBuf>,
    max_connections: Option<i64>,
    utp: Option<bool>,
) -> ConfigPatch {
    ConfigPatch {
        storage_dir,
        max_connections,
        utp,
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok(Reply),
    Error { code: String, message: String },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Message { message: String },
    Session { session: Session },
    Page(Page),
    Config { config: Config },
    Location { path: PathBuf },
}

impl Response {
    pub fn message(text: impl Into<String>) -> Self {
        Response::Ok(Reply::Message {
            message: text.into(),
        })
    }

    pub fn session(session: Session) -> Self {
        Response::Ok(Reply::Session { session })
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<CommandError> for Response {
    fn from(err: CommandError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

impl<T> From<Result<T, CommandError>> for Response
where
    T: Into<Reply>,
{
    fn from(result: Result<T, CommandError>) -> Self {
        match result {
            Ok(value) => Response::Ok(value.into()),
            Err(e) => e.into(),
        }
    }
}

impl From<Session> for Reply {
    fn from(session: Session) -> Self {
        Reply::Session { session }
    }
}

impl From<Page> for Reply {
    fn from(page: Page) -> Self {
        Reply::Page(page)
    }
}

impl From<PathBuf> for Reply {
    fn from(path: PathBuf) -> Self {
        Reply::Location { path }
    }
}

impl From<Config> for Reply {
    fn from(config: Config) -> Self {
        Reply::Config { config }
    }
}
