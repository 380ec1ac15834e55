//! SentinelForge server entrypoint

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinelforge::pipeline::{HeuristicScorer, RulePolicy, SimulatedRunner};
use sentinelforge::store::{EventStore, PgStore};
use sentinelforge::{create_router, spawn_sweeper, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinelforge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing::info!("SentinelForge starting...");

    // Select the store backend: PostgreSQL when configured and reachable,
    // in-memory otherwise. The choice is final for the process lifetime.
    let store = match &config.database_url {
        Some(url) => match PgStore::connect(url).await {
            Ok(pg) => {
                tracing::info!("connected to PostgreSQL");
                EventStore::Postgres(pg)
            }
            Err(err) => {
                tracing::warn!(error = %err, "database unreachable, using in-memory store");
                EventStore::in_memory()
            }
        },
        None => {
            tracing::info!("no DATABASE_URL set, using in-memory store");
            EventStore::in_memory()
        }
    };

    // Build application state with the default collaborators
    let state = AppState::build(
        Arc::new(store),
        Some(Arc::new(HeuristicScorer)),
        Some(Arc::new(RulePolicy)),
        Arc::new(SimulatedRunner::new()),
        config.clone(),
    );

    // Background expiry sweep for actions awaiting confirmation
    spawn_sweeper(&state);

    // Build router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("🚀 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
