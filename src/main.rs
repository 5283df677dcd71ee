//! ALN orchestrator binary entrypoint wiring REST, WebSocket, SSE, and snapshot persistence.

use std::{env, net::SocketAddr, sync::Arc};

use aln_orchestrator::{
    catalog::TokenCatalog,
    config::AppConfig,
    dao::snapshot_store::{FileSnapshotStore, SnapshotStore},
    routes,
    services::{bootstrap, storage_supervisor},
    state::{AppState, SharedState},
};
use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let catalog = TokenCatalog::load(config.tokens_path());
    let store: Option<Arc<dyn SnapshotStore>> = config
        .snapshot_path()
        .map(|path| Arc::new(FileSnapshotStore::new(path.to_path_buf())) as Arc<dyn SnapshotStore>);
    let app_state = AppState::new(config, catalog);

    bootstrap::start(&app_state, store.as_deref())
        .await
        .context("starting connection lifecycle")?;
    let supervisor = store
        .clone()
        .map(|store| storage_supervisor::spawn(&app_state, store));

    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    bootstrap::mark_listening(&app_state)
        .await
        .context("marking lifecycle listening")?;

    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    shutdown(&app_state, supervisor, store).await;
    Ok(())
}

/// Stop background tasks and write a final snapshot.
async fn shutdown(
    state: &SharedState,
    supervisor: Option<tokio::task::JoinHandle<()>>,
    store: Option<Arc<dyn SnapshotStore>>,
) {
    bootstrap::teardown(state).await;
    if let Some(handle) = supervisor {
        handle.abort();
    }
    if let Some(store) = store {
        if let Err(err) = storage_supervisor::flush(state, store.as_ref()).await {
            warn!(error = %err, "final session snapshot failed");
        }
    }
    info!("server stopped");
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
