//! Application context: built once at startup, owns every component and
//! runs the shutdown sequence.

use crate::core::config::TELEMETRY_INTERVAL;
use crate::core::durable::DurableWriter;
use crate::core::engine::{LocalEngine, TransferEngine};
use crate::core::ledger::Ledger;
use crate::core::reconciler::Reconciler;
use crate::core::settings::ConfigStore;
use crate::core::status::StatusProjector;
use crate::core::telemetry;
use crate::utils::paths::DataPaths;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::Args;
use crate::workers::server::{Control, ControlServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct App {
    port: u16,
    config: Arc<ConfigStore>,
    engine: Arc<dyn TransferEngine>,
    writer: Arc<DurableWriter>,
    reconciler: Arc<Reconciler>,
    status: Arc<StatusProjector>,
    sos: SignalOfStop,
}

impl App {
    /// Load config and ledger, start the engine and replay the ledger.
    /// Nothing is served yet.
    pub async fn bootstrap(args: &Args, paths: &DataPaths) -> Result<Self> {
        let config = Arc::new(ConfigStore::load(paths.config_file()));
        let settings = config.get();

        std::fs::create_dir_all(&settings.storage_dir).with_context(|| {
            format!(
                "Cannot create storage directory {}",
                settings.storage_dir.display()
            )
        })?;

        let engine: Arc<dyn TransferEngine> =
            Arc::new(LocalEngine::new(settings.engine_options()));

        let ledger_path = paths.ledger_file();
        let ledger = Ledger::load(&ledger_path).with_context(|| {
            format!(
                "Refusing to start with an unreadable ledger; fix or move {}",
                ledger_path.display()
            )
        })?;

        let writer = Arc::new(DurableWriter::new(ledger_path, args.persist_policy()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&engine),
            Arc::clone(&writer),
            Arc::clone(&config),
            ledger,
        ));
        let status = Arc::new(StatusProjector::new(Arc::clone(&reconciler)));

        info!(
            event = "startup",
            data_dir = %paths.root().display(),
            storage_dir = %settings.storage_dir.display(),
            persist = writer.policy().label(),
            "seedkeeper starting"
        );
        reconciler.replay().await;

        Ok(Self {
            port: args.port,
            config,
            engine,
            writer,
            reconciler,
            status,
            sos: SignalOfStop::new(),
        })
    }

    /// Serve until SIGINT, SIGTERM or a `shutdown` request, then shut down.
    pub async fn run(self) -> Result<()> {
        let server = ControlServer::bind(self.port).await?;

        let ticker = self.writer.spawn_ticker(self.sos.clone());
        let usage = telemetry::spawn(
            Arc::clone(&self.status),
            TELEMETRY_INTERVAL,
            self.sos.clone(),
        );
        spawn_signal_watcher(self.sos.clone());

        let served = server
            .run(Control {
                reconciler: Arc::clone(&self.reconciler),
                status: Arc::clone(&self.status),
                config: Arc::clone(&self.config),
                sos: self.sos.clone(),
            })
            .await;
        if let Err(e) = &served {
            error!(event = "control_failure", error = %format!("{e:#}"), "Control server failed");
        }

        self.sos.cancel();
        self.shutdown().await;
        let _ = tokio::join!(ticker, usage);
        served
    }

    /// Stop accepting commands, flush pending writes, release every handle,
    /// then stop the engine.
    async fn shutdown(&self) {
        self.reconciler.close().await;

        if let Err(e) = self.writer.flush().await {
            error!(
                event = "shutdown_flush_failure",
                error = %format!("{e:#}"),
                "Final ledger write failed; on-disk ledger may be behind"
            );
        }

        let released = self.reconciler.release_all().await;
        if let Err(e) = self.engine.shutdown().await {
            warn!(event = "engine_shutdown_failure", error = %e, "Engine shutdown failed");
        }
        info!(event = "shutdown_complete", released, "seedkeeper stopped");
    }
}

fn spawn_signal_watcher(sos: SignalOfStop) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                        _ = sos.wait() => return,
                    }
                }
                Err(e) => {
                    warn!(event = "signal_setup_failure", error = %e, "SIGTERM handler unavailable");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sos.wait() => return,
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sos.wait() => return,
            }
        }
        info!(event = "signal_received", "Stop signal received");
        sos.cancel();
    });
}
