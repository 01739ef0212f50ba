use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod bot;
mod config;
mod error;
mod normalize;
mod probe;
mod records;
mod registry;
mod render;
mod request;
mod resolver;
mod session;

use api::AnimeApi;
use config::Config;
use registry::Registry;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!(?config, "starting anibridge");

    let registry = Registry::builtin().select(&config.backends);
    let names: Vec<&str> = registry.iter().map(|backend| backend.name()).collect();
    info!(backends = ?names, "upstream registry ready");

    let api = Arc::new(AnimeApi::new(registry, config.api_settings()));
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    if let Err(e) = bot::run(&config, api, shutdown).await {
        error!(error = %e, "bot runtime failed");
        std::process::exit(1);
    }
    info!("goodbye");
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
