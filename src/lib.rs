//! SentinelForge - autonomous threat response pipeline
//!
//! Turns raw runtime-security sensor reports into remediation actions:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SENTINELFORGE                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────┐  ┌─────────┐  ┌────────────┐  ┌──────────────┐  │
//! │  │ Intake │─▶│ Scoring │─▶│ Confirm    │─▶│ Execution    │  │
//! │  │ (Axum) │  │ Adapter │  │ Gate       │  │ (per-resource│  │
//! │  │        │  │         │  │            │  │  lanes)      │  │
//! │  └────┬───┘  └────┬────┘  └─────┬──────┘  └──────┬───────┘  │
//! │       └───────────┴─────────────┴────────────────┘          │
//! │                          ▼                                  │
//! │             ┌─────────────────────────┐                     │
//! │             │ Event Store (PG/memory) │──▶ lifecycle stream │
//! │             └─────────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod stream;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use config::Config;
pub use error::{AppResult, PipelineError};

use pipeline::{
    ActionExecutor, ActionRunner, AnomalyScorer, ConfirmationGate, EventIngestor, Pipeline,
    PolicyAgent, ScoringAdapter,
};
use store::EventStore;
use stream::Broadcaster;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub pipeline: Arc<Pipeline>,
    pub gate: Arc<ConfirmationGate>,
    pub broadcaster: Broadcaster,
    pub config: Config,
}

impl AppState {
    /// Wire the full pipeline around one store and one set of
    /// collaborators. Absent collaborators run the pipeline degraded.
    pub fn build(
        store: Arc<EventStore>,
        scorer: Option<Arc<dyn AnomalyScorer>>,
        policy: Option<Arc<dyn PolicyAgent>>,
        runner: Arc<dyn ActionRunner>,
        config: Config,
    ) -> Self {
        let broadcaster = Broadcaster::new(config.stream_buffer);

        let ingestor = EventIngestor::new(store.clone(), broadcaster.clone());
        let scoring = ScoringAdapter::new(
            scorer,
            policy,
            config.scoring_timeout,
            config.fallback_confidence,
        );
        let gate = Arc::new(ConfirmationGate::new(
            store.clone(),
            broadcaster.clone(),
            config.clone(),
        ));
        let executor = Arc::new(ActionExecutor::new(
            store.clone(),
            broadcaster.clone(),
            runner,
            config.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            ingestor,
            scoring,
            gate.clone(),
            executor,
            broadcaster.clone(),
        ));

        Self {
            store,
            pipeline,
            gate,
            broadcaster,
            config,
        }
    }
}

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::check))
        // Event intake
        .route("/api/v1/events", post(handlers::events::ingest))
        // Threats
        .route("/api/v1/threats", get(handlers::threats::list))
        .route("/api/v1/threats/:id", get(handlers::threats::get))
        // Actions
        .route("/api/v1/actions", get(handlers::actions::list))
        .route("/api/v1/actions/:id", get(handlers::actions::get))
        .route("/api/v1/actions/:id/confirm", post(handlers::actions::confirm))
        // Lifecycle stream
        .route("/api/v1/stream", get(handlers::stream::subscribe))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Spawn the periodic expiry sweep for parked actions.
pub fn spawn_sweeper(state: &AppState) -> tokio::task::JoinHandle<()> {
    let gate = state.gate.clone();
    let interval = state.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match gate.sweep().await {
                Ok(0) => {}
                Ok(expired) => tracing::info!(expired, "expired overdue actions"),
                Err(err) => tracing::error!(error = %err, "expiry sweep failed"),
            }
        }
    })
}
