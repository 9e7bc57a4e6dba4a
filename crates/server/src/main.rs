mod api;
mod config;
mod convert;
mod scan;
mod state;
mod transcode;
mod utils;
mod watch;

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use catalog::Catalog;
use parking_lot::{Mutex, RwLock};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use api::api_router;
use config::{config_path_from_env, load_or_create_config, resolve_path};
use scan::{start_autoscan, start_lock_watchdog};
use state::AppState;
use watch::configure_watcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let port = if config.port == 0 { 3000 } else { config.port };
    let catalog_path = resolve_path(&config_path, &config.catalog_path);
    let catalog = Catalog::open(&catalog_path)?;
    info!("Catalog open at {:?}", catalog_path);

    let state = AppState {
        catalog,
        config: Arc::new(RwLock::new(config)),
        config_path,
        watcher: Arc::new(RwLock::new(None)),
        active_jobs: Arc::new(Mutex::new(HashSet::new())),
    };

    configure_watcher(&state);
    start_lock_watchdog(state.clone());
    start_autoscan(state.clone());

    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
