use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use metrics_http_exporter::config::{Config, ConfigError};
use metrics_http_exporter::delivery::{ClientBuildError, HttpSender};
use metrics_http_exporter::ingest;
use metrics_http_exporter::pipeline::{Pipeline, PipelineConfig};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Client(#[from] ClientBuildError),

    #[error("failed to bind ingest listener on {addr}: {source}")]
    ListenerBind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to install signal handler: {0}")]
    Signal(std::io::Error),
}

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("METRICS_EXPORTER_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid METRICS_EXPORTER_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring provider");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str, InitError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).map_err(InitError::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(InitError::Signal)?;
    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str, InitError> {
    tokio::signal::ctrl_c().await.map_err(InitError::Signal)?;
    Ok("Ctrl+C")
}

async fn run() -> Result<(), InitError> {
    let config = Config::from_env()?;
    // The HTTP client is built before anything can be submitted.
    let sender = Arc::new(HttpSender::new(&config)?);
    info!(endpoint = %sender.endpoint(), "exporter configured");

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.listener_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| InitError::ListenerBind { addr, source })?;

    let pipeline = Arc::new(Pipeline::start(sender, PipelineConfig::from(&config)));
    let cancel = CancellationToken::new();
    let server = tokio::spawn(ingest::serve(
        listener,
        Arc::clone(&pipeline),
        cancel.clone(),
    ));
    info!(%addr, path = ingest::INGEST_PATH, "accepting metric batches");

    let signal = wait_for_shutdown_signal().await?;
    info!(signal, "shutting down");

    cancel.cancel();
    if let Err(e) = server.await {
        warn!(error = %e, "ingest listener task failed");
    }
    let stats = pipeline.shutdown(config.drain_timeout).await;
    info!(
        submitted = stats.batches_submitted,
        rejected = stats.batches_rejected,
        acked = stats.batches_acked,
        dropped = stats.batches_dropped,
        records_sent = stats.records_sent,
        records_dropped = stats.records_dropped,
        send_failures = stats.send_failures,
        "final export stats"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    if let Err(e) = run().await {
        fatal("exporter failed", &e);
    }
}
