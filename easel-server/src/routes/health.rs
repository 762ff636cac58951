use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
}

pub async fn get_root() -> Json<Value> {
    Json(json!({ "message": "Easel API is running!" }))
}

/// Liveness check.
pub async fn get_health() -> Json<Value> {
    Json(json!({
        "status":  "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn health_reports_healthy() {
        let Json(body) = get_health().await;
        assert_eq!(body["status"], "healthy");
        assert!(!body["version"].as_str().unwrap_or("").is_empty());
    }
}
