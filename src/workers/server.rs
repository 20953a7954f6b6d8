//! Loopback control server: decodes requests, calls the command surface,
//! encodes responses. No logic beyond argument defaulting and error-code
//! mapping lives here.

use crate::core::config::{DEFAULT_PAGE_SIZE, MAX_REQUEST_BYTES};
use crate::core::error::CommandError;
use crate::core::reconciler::Reconciler;
use crate::core::session::ContentId;
use crate::core::settings::ConfigStore;
use crate::core::status::StatusProjector;
use crate::utils::sos::SignalOfStop;
use crate::workers::protocol::{Request, Response, config_patch};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct Control {
    pub reconciler: Arc<Reconciler>,
    pub status: Arc<StatusProjector>,
    pub config: Arc<ConfigStore>,
    pub sos: SignalOfStop,
}

pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    /// Bind `127.0.0.1:<port>`. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control socket: {addr}"))?;
        info!(event = "control_listening", addr = %addr, "Control server listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read control socket address")
    }

    /// Accept clients until the stop signal fires.
    pub async fn run(self, control: Control) -> Result<()> {
        loop {
            tokio::select! {
                _ = control.sos.wait() => break,
                accept = self.listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(event = "control_accept_failure", error = %e, "Accept failed");
                            continue;
                        }
                    };
                    debug!(event = "control_client", peer = %peer, "Client connected");
                    let control = control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, control).await {
                            warn!(event = "control_client_error", error = %format!("{e:#}"), "Control connection error");
                        }
                    });
                }
            }
        }
        info!(event = "control_stopped", "Control server stopped");
        Ok(())
    }
}

async fn handle_client(stream: TcpStream, control: Control) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    let limit = MAX_REQUEST_BYTES as u64 + 1;

    loop {
        line.clear();
        let mut bounded = (&mut reader).take(limit);
        let read = tokio::select! {
            _ = control.sos.wait() => break,
            read = bounded.read_until(b'\n', &mut line) => {
                read.context("Failed reading control request")?
            }
        };
        if read == 0 {
            break;
        }
        if line.len() > MAX_REQUEST_BYTES {
            warn!(event = "control_request_too_long", "Oversized request; closing connection");
            let response = Response::error(
                "invalid_request",
                format!("request exceeds {MAX_REQUEST_BYTES} bytes"),
            );
            write_response(&mut write_half, &response).await?;
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match serde_json::from_slice::<Request>(&line) {
            Ok(request) => {
                debug!(event = "control_request", cmd = request.name(), "Request received");
                handle_request(&control, request).await
            }
            Err(e) => Response::error("invalid_request", e.to_string()),
        };
        write_response(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(response).context("Failed to serialize response")?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .context("Failed writing control response")?;
    writer
        .flush()
        .await
        .context("Failed flushing control response")
}

pub async fn handle_request(control: &Control, request: Request) -> Response {
    match request {
        Request::Ping => Response::message("pong"),
        Request::Add { magnet } => control.reconciler.add_by_descriptor(&magnet).await.into(),
        Request::AddLocal { name } => control.reconciler.add_local(&name).await.into(),
        Request::Import { source, name } => {
            let name = match name.or_else(|| file_name_of(&source)) {
                Some(name) => name,
                None => {
                    return CommandError::validation("import needs a name or a source file name")
                        .into();
                }
            };
            control
                .reconciler
                .import_local_file(&source, &name)
                .await
                .into()
        }
        Request::Pause { info_hash } => match parse_id(&info_hash) {
            Ok(id) => control.reconciler.pause(&id).await.into(),
            Err(e) => e.into(),
        },
        Request::Resume { info_hash } => match parse_id(&info_hash) {
            Ok(id) => control.reconciler.resume(&id).await.into(),
            Err(e) => e.into(),
        },
        Request::Remove { info_hash } => match parse_id(&info_hash) {
            Ok(id) => control.reconciler.remove(&id).await.into(),
            Err(e) => e.into(),
        },
        Request::Locate { info_hash } => match parse_id(&info_hash) {
            Ok(id) => control.reconciler.locate(&id).into(),
            Err(e) => e.into(),
        },
        Request::List { page, page_size } => control
            .status
            .list(page.unwrap_or(1), page_size.unwrap_or(DEFAULT_PAGE_SIZE))
            .into(),
        Request::GetConfig => Ok::<_, CommandError>(control.config.get()).into(),
        Request::SetConfig {
            storage_dir,
            max_connections,
            utp,
        } => control
            .config
            .set(config_patch(storage_dir, max_connections, utp))
            .into(),
        Request::Shutdown => {
            info!(event = "shutdown_requested", "Shutdown requested over control socket");
            control.sos.cancel();
            Response::message("shutting down")
        }
    }
}

fn parse_id(raw: &str) -> Result<ContentId, CommandError> {
    ContentId::parse(raw)
        .ok_or_else(|| CommandError::validation(format!("invalid info hash: {raw:?}")))
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::durable::{DurableWriter, PersistPolicy};
    use crate::core::engine::testing::ScriptedEngine;
    use crate::core::ledger::Ledger;
    use crate::core::settings::Config;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    fn control(dir: &TempDir) -> Control {
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        let config = Arc::new(ConfigStore::with_config(
            dir.path().join("config.json"),
            Config {
                storage_dir: storage,
                max_connections: 10,
                utp: false,
            },
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(ScriptedEngine::new()),
            Arc::new(DurableWriter::new(
                dir.path().join("torrents.json"),
                PersistPolicy::Immediate,
            )),
            Arc::clone(&config),
            Ledger::new(),
        ));
        Control {
            status: Arc::new(StatusProjector::new(Arc::clone(&reconciler))),
            reconciler,
            config,
            sos: SignalOfStop::new(),
        }
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn send(&mut self, raw: &str) -> Value {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn serves_commands_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let control = control(&dir);
        let server = ControlServer::bind(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run(control.clone()));

        let mut client = Client::connect(addr).await;
        assert_eq!(
            client.send(r#"{"cmd":"ping"}"#).await,
            json!({"status": "ok", "message": "pong"})
        );

        let added = client
            .send(r#"{"cmd":"add","magnet":"magnet:?xt=urn:btih:c0ffee&dn=beans.iso"}"#)
            .await;
        assert_eq!(added["status"], "ok");
        assert_eq!(added["session"]["infoHash"], "c0ffee");
        assert_eq!(added["session"]["state"], "active");

        let dup = client
            .send(r#"{"cmd":"add","magnet":"magnet:?xt=urn:btih:c0ffee&dn=beans.iso"}"#)
            .await;
        assert_eq!(dup["code"], "duplicate_session");

        let listed = client.send(r#"{"cmd":"list"}"#).await;
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["pageSize"], 10);
        assert_eq!(listed["items"][0]["live"], true);

        let paused = client.send(r#"{"cmd":"pause","infoHash":"C0FFEE"}"#).await;
        assert_eq!(paused["session"]["state"], "paused");

        let missing = client.send(r#"{"cmd":"remove","info_hash":"dead"}"#).await;
        assert_eq!(missing["code"], "not_found");

        let bad_id = client.send(r#"{"cmd":"resume","info_hash":"zz"}"#).await;
        assert_eq!(bad_id["code"], "validation_error");

        let garbage = client.send("{not json").await;
        assert_eq!(garbage["status"], "error");
        assert_eq!(garbage["code"], "invalid_request");

        let page = client.send(r#"{"cmd":"list","page":0}"#).await;
        assert_eq!(page["code"], "validation_error");

        let bye = client.send(r#"{"cmd":"shutdown"}"#).await;
        assert_eq!(bye["status"], "ok");
        assert!(control.sos.cancelled());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn oversized_request_is_refused_and_connection_closed() {
        let dir = tempfile::tempdir().unwrap();
        let control = control(&dir);
        let server = ControlServer::bind(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run(control.clone()));

        let mut client = Client::connect(addr).await;
        let flood = "a".repeat(MAX_REQUEST_BYTES + 1);
        client.writer.write_all(flood.as_bytes()).await.unwrap();
        let mut reply = String::new();
        client.reader.read_line(&mut reply).await.unwrap();
        let refused: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(refused["code"], "invalid_request");

        let mut rest = String::new();
        let read = tokio::time::timeout(
            Duration::from_secs(1),
            client.reader.read_line(&mut rest),
        )
        .await
        .expect("connection was not closed");
        assert_eq!(read.unwrap_or(0), 0);

        let mut fresh = Client::connect(addr).await;
        assert_eq!(fresh.send(r#"{"cmd":"ping"}"#).await["status"], "ok");

        control.sos.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let control = control(&dir);

        let got = serde_json::to_value(handle_request(&control, Request::GetConfig).await).unwrap();
        assert_eq!(got["config"]["maxConns"], 10);

        let set = serde_json::to_value(
            handle_request(
                &control,
                Request::SetConfig {
                    storage_dir: None,
                    max_connections: Some(-1),
                    utp: None,
                },
            )
            .await,
        )
        .unwrap();
        assert_eq!(set["code"], "validation_error");

        let set = serde_json::to_value(
            handle_request(
                &control,
                Request::SetConfig {
                    storage_dir: None,
                    max_connections: Some(64),
                    utp: Some(true),
                },
            )
            .await,
        )
        .unwrap();
        assert_eq!(set["status"], "ok");
        assert_eq!(set["config"]["maxConns"], 64);
        assert_eq!(set["config"]["utp"], true);
    }

    #[tokio::test]
    async fn locate_reports_path_or_what_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let control = control(&dir);
        let storage = dir.path().join("storage");
        std::fs::write(storage.join("reel.mp4"), b"frames").unwrap();
        let seeded = control.reconciler.add_local("reel.mp4").await.unwrap();
        let fetching = control
            .reconciler
            .add_by_descriptor("magnet:?xt=urn:btih:beef&dn=later.mp4")
            .await
            .unwrap();

        let locate = |info_hash: String| {
            let control = control.clone();
            async move {
                serde_json::to_value(handle_request(&control, Request::Locate { info_hash }).await)
                    .unwrap()
            }
        };

        let found = locate(seeded.content_id.to_string()).await;
        assert_eq!(found["status"], "ok");
        assert_eq!(found["path"], json!(storage.join("reel.mp4")));

        let absent = locate(fetching.content_id.to_string()).await;
        assert_eq!(absent["code"], "not_found");
        assert!(absent["message"].as_str().unwrap().contains("no local content"));

        let unknown = locate("dead".to_string()).await;
        assert_eq!(unknown["code"], "not_found");
        assert!(unknown["message"].as_str().unwrap().contains("no session"));
    }

    #[tokio::test]
    async fn import_defaults_name_to_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let control = control(&dir);
        let outside = tempfile::tempdir().unwrap();
        let source = outside.path().join("holiday.mov");
        std::fs::write(&source, b"frames").unwrap();

        let reply = serde_json::to_value(
            handle_request(&control, Request::Import { source, name: None }).await,
        )
        .unwrap();
        assert_eq!(reply["session"]["name"], "holiday.mov");
        assert!(dir.path().join("storage").join("holiday.mov").exists());
    }
}
