//! Race lifecycle binary entrypoint wiring REST, SSE, the scheduler and the race store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use race_lifecycle::{
    config::AppConfig,
    dao::race_store::{RaceStore, memory::MemoryRaceStore},
    routes,
    services::{scheduler, storage_supervisor},
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let app_state = build_state(AppConfig::load());
    spawn_storage(app_state.clone())?;

    if app_state.config().scheduler.enabled {
        tokio::spawn(scheduler::run(app_state.clone()));
    } else {
        info!("internal scheduler disabled; expecting POST /scheduler/tick");
    }

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Shared state with the push transport selected from the environment.
fn build_state(config: AppConfig) -> SharedState {
    let builder = AppState::builder(config);

    #[cfg(feature = "webhook-push")]
    let builder = match race_lifecycle::services::push::WebhookPushSender::from_env() {
        Some(sender) => {
            info!("forwarding notifications to PUSH_WEBHOOK_URL");
            builder.push(Arc::new(sender))
        }
        None => builder,
    };

    builder.build()
}

/// Start the storage supervisor for the backend named by `RACE_STORE` (default `memory`).
fn spawn_storage(state: SharedState) -> anyhow::Result<()> {
    let backend = env::var("RACE_STORE").unwrap_or_else(|_| "memory".into());

    match backend.trim().to_ascii_lowercase().as_str() {
        "memory" => {
            warn!("using the in-memory race store; races are lost on restart");
            tokio::spawn(storage_supervisor::run(state, || async {
                Ok(Arc::new(MemoryRaceStore::new()) as Arc<dyn RaceStore>)
            }));
        }
        #[cfg(feature = "couch-store")]
        "couch" | "couchdb" => {
            use race_lifecycle::dao::race_store::couchdb::{CouchConfig, CouchRaceStore};

            let config = CouchConfig::from_env().context("reading CouchDB settings")?;
            tokio::spawn(storage_supervisor::run(state, move || {
                let config = config.clone();
                async move {
                    let store = CouchRaceStore::connect(config).await?;
                    Ok(Arc::new(store) as Arc<dyn RaceStore>)
                }
            }));
        }
        #[cfg(feature = "mongo-store")]
        "mongo" | "mongodb" => {
            use race_lifecycle::dao::race_store::mongodb::{MongoConfig, MongoRaceStore};

            tokio::spawn(storage_supervisor::run(state, || async {
                let config = MongoConfig::from_env().await?;
                let store = MongoRaceStore::connect(config).await?;
                Ok(Arc::new(store) as Arc<dyn RaceStore>)
            }));
        }
        other => anyhow::bail!("unsupported RACE_STORE `{other}`"),
    }

    Ok(())
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
