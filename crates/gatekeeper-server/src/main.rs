//! Gatekeeper scheduler server: binds the HTTP surface to a
//! `SchedulingEngine` backed by a SQLite history sink, and runs the expiry
//! ticker in the background for the lifetime of the process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gatekeeper_core::{ticker, GatekeeperConfig, InMemoryMetricsProvider, SchedulingEngine};
use gatekeeper_history_sqlite::SqliteHistorySink;
use gatekeeper_server::build_router;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "gatekeeper-server")]
#[command(about = "Admission-controlled job scheduler over HTTP")]
struct Args {
    /// Server port (overrides GATEKEEPER_SERVER_PORT).
    #[arg(long, env = "GATEKEEPER_SERVER_PORT", default_value_t = 9001)]
    port: u16,

    /// Server bind host.
    #[arg(long, env = "GATEKEEPER_SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Path to the SQLite history database file.
    #[arg(long, env = "GATEKEEPER_HISTORY_DB_PATH", default_value = "gatekeeper_history.db")]
    history_db_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gatekeeper_server=info,gatekeeper_core=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatekeeperConfig::from_env();
    info!(?config, "loaded configuration");

    let history = Arc::new(SqliteHistorySink::connect(&args.history_db_path).await?);
    let metrics = Arc::new(InMemoryMetricsProvider::new());
    let engine = Arc::new(
        SchedulingEngine::builder(config.clone())
            .metrics(metrics.clone())
            .history(history)
            .build(),
    );

    let ticker_handle = ticker::spawn(engine.clone(), Duration::from_millis(config.expiry_tick_interval_ms));
    let cleanup_handle = spawn_history_cleanup(engine.clone(), config.history_retention_days);

    let app = build_router(engine, metrics);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!(%addr, "starting gatekeeper-server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app).await;
    ticker_handle.abort();
    cleanup_handle.abort();
    serve_result?;
    Ok(())
}

/// Periodic maintenance task: history is write-mostly and never shrinks on
/// its own, so the server prunes rows older than `retention_days` once an
/// hour in the background (SPEC_FULL.md §4.6). Manual pruning remains
/// available via `POST /history/cleanup` for operators who want it sooner.
fn spawn_history_cleanup(engine: Arc<SchedulingEngine>, retention_days: i64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.history().cleanup(retention_days).await {
                Ok(removed) => info!(removed, retention_days, "history cleanup tick"),
                Err(err) => tracing::error!(error = %err, "history cleanup failed"),
            }
        }
    })
}
