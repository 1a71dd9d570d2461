use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use test_sink::{Sink, SinkConfig};

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(LevelFilter::DEBUG)
        .with(tracing_microjson::JsonLayer::new(std::io::stdout).with_target(true))
        .init();
}

#[tokio::main]
async fn main() {
    setup_logging();

    let config = SinkConfig::from_env().unwrap_or_else(|e| {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(%addr, error = %e, "failed to bind");
        std::process::exit(1);
    });
    info!(
        %addr,
        dump_dir = %config.dump_dir.display(),
        config_file = %config.config_file.display(),
        "test sink listening"
    );

    let cancel = CancellationToken::new();
    let server = tokio::spawn(test_sink::serve(
        listener,
        Arc::new(Sink::new(&config)),
        cancel.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
    }
    cancel.cancel();
    let _ = server.await;
}
