mod config;
mod error;
mod routes;
mod state;
mod stream;

use config::ServerConfig;
use state::AppState;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting mtf-data stream server");

    // Configurable via MTF_* env vars, see ServerConfig
    let config = ServerConfig::from_env();
    info!(?config, "loaded configuration");

    let state = AppState::new(&config);
    let pipeline = state.spawn_pipeline();

    let listener = match TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(addr = %config.addr, %error, "failed to bind server address");
            return;
        }
    };

    info!("Stream server listening on http://{}", config.addr);
    info!("Clients can subscribe at /stream/market?symbols=<csv>&timeframe=<tf>&sinceSeq=<n>");

    if let Err(error) = axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%error, "server terminated with error");
    }

    pipeline.abort();
    info!("Stream server stopped");
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, gracefully stopping"),
        Err(error) => {
            error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    }
}

/// `MTF_LOG_FORMAT=json` switches to JSON lines; the level comes from `RUST_LOG`.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("MTF_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
