use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use connect_core::auth::Authenticator;
use connect_core::config::ConnectorConfig;
use connect_core::metrics::{InMemoryMetrics, Metrics};
use connect_engine::Engine;
use connect_fetch::HttpFetcher;
use connect_worker::{apply_env_overrides, load_offsets, load_properties, log_records, poll_interval, save_offsets};
use tokio::sync::Notify;
use tracing::info;

/// Pull-based HTTP ingestion worker.
#[derive(Parser, Debug)]
#[command(name = "connect-worker", version, about)]
struct Cli {
    /// Path to the connector's TOML config file.
    #[arg(long, env = "CONNECT_CONFIG", default_value = "config/connect.toml")]
    config: PathBuf,

    /// Path to the offset-persistence file, read on start and rewritten after each poll.
    #[arg(long, env = "CONNECT_OFFSETS_FILE", default_value = "connect-offsets.json")]
    offsets_file: PathBuf,
}

struct ConnectWorker {
    engine: Arc<Engine>,
    offsets_file: PathBuf,
    shutdown: Arc<Notify>,
}

impl ConnectWorker {
    async fn run_loop(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let batch = self.engine.poll().await;
                    info!(
                        records = batch.records.len(),
                        chain_events = batch.chain_metadata.len(),
                        "poll complete"
                    );
                    log_records(&batch.records);

                    for event in self.engine.drain_dlq() {
                        tracing::warn!(
                            endpoint_id = %event.endpoint_id,
                            status = ?event.status,
                            "dead-letter event"
                        );
                    }

                    if !batch.offsets.is_empty() {
                        if let Err(e) = save_offsets(&self.offsets_file, &batch.offsets) {
                            tracing::error!(error = %e, "failed to persist offsets");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("connect-worker shutting down");
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut props = match load_properties(&cli.config) {
        Ok(props) => {
            info!(path = %cli.config.display(), "loaded connector config");
            props
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %cli.config.display(),
                "failed to load config, using empty property set"
            );
            Default::default()
        }
    };
    apply_env_overrides(&mut props);

    let interval = poll_interval(&props);
    let config = ConnectorConfig::from_properties(&props)?;

    let restored_offsets = load_offsets(&cli.offsets_file);
    let fetcher = Arc::new(HttpFetcher::default());
    let authenticators: HashMap<String, Arc<dyn Authenticator>> = HashMap::new();
    let metrics: Arc<dyn Metrics> = Arc::new(InMemoryMetrics::default());

    let engine = Engine::start(config, fetcher, authenticators, metrics, &restored_offsets)?;

    let shutdown = Arc::new(Notify::new());
    let worker = Arc::new(ConnectWorker {
        engine,
        offsets_file: cli.offsets_file.clone(),
        shutdown: shutdown.clone(),
    });

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
    });

    info!("connect-worker starting");
    worker.run_loop(interval).await;
    info!("connect-worker exited cleanly");
    Ok(())
}
