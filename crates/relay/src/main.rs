mod config;
mod listener;

use std::sync::Arc;

use timeline::http::HttpTransport;
use timeline::opentsdb::OpenTsdbTransport;
use timeline::{Batcher, Transport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::Config;

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("TIMELINE_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid TIMELINE_RELAY_LOG_LEVEL: {val:?}, defaulting to WARN");
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

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));

    let http = HttpTransport::new(&config.transport_config, config.http.clone())
        .unwrap_or_else(|e| fatal("failed to build HTTP transport", &e));
    if http.matches(config.transport) {
        return run(http, &config).await;
    }

    let opentsdb = OpenTsdbTransport::new(&config.transport_config);
    if opentsdb.matches(config.transport) {
        return run(opentsdb, &config).await;
    }

    fatal("no transport registered", &config.transport);
}

/// Wire `transport` behind a batcher and the ingest listener, then serve
/// until Ctrl-C. Shutdown stops intake first so the final drain sees every
/// accepted point.
async fn run<T: Transport>(mut transport: T, config: &Config) {
    transport
        .configure(&config.backend)
        .unwrap_or_else(|e| fatal("failed to configure transport", &e));

    let batcher = Batcher::new(transport, &config.transport_config)
        .unwrap_or_else(|e| fatal("invalid transport configuration", &e));
    let batcher = Arc::new(batcher);
    batcher
        .start()
        .unwrap_or_else(|e| fatal("failed to start batcher", &e));

    let listener = TcpListener::bind(("127.0.0.1", config.listener_port))
        .await
        .unwrap_or_else(|e| fatal("failed to bind ingest listener", &e));
    info!(
        port = config.listener_port,
        transport = %config.transport,
        backend = %config.backend.host,
        "timeline relay started"
    );

    let cancel = CancellationToken::new();
    let listener_task = tokio::spawn(listener::serve(
        listener,
        Arc::clone(&batcher),
        cancel.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    cancel.cancel();
    if let Err(e) = listener_task.await {
        error!(error = %e, "ingest listener task panicked");
    }

    batcher.close();
    batcher.wait_closed().await;
    info!("shutdown complete");
}
