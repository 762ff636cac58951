//! Axum router construction.
//!
//! [`build`] assembles the application router:
//! - `/` and `/health`
//! - generation, streaming and model routes under `/api`
//! - generated images served from the outputs directory under `/images`

mod generate;
mod health;
mod models;
mod stream;

use std::sync::Arc;

use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::middleware::cors_layer;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(generate::router())
        .merge(stream::router())
        .merge(models::router());
    let images = ServeDir::new(&state.orchestrator.config().outputs_dir);

    Router::new()
        .merge(health::router())
        .nest("/api", api)
        .nest_service("/images", images)
        .layer(cors_layer(&state.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
