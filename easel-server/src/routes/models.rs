//! Model listing and recommended parameters.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use easel_core::{
    all_model_defaults, has_model_defaults, model_defaults, EaselError, GenerationDefaults,
    ModelDescriptor,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Serialize, Debug)]
pub struct ModelsResponse {
    pub success: bool,
    pub models: Vec<ModelDescriptor>,
    pub message: String,
}

#[derive(Serialize, Debug)]
pub struct AllDefaultsResponse {
    pub success: bool,
    pub defaults: BTreeMap<String, GenerationDefaults>,
    pub message: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/defaults/all", get(get_all_defaults))
        .route("/models/{name}", get(get_model))
        .route("/models/{name}/defaults", get(get_model_defaults))
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ModelsResponse>, ServerError> {
    match state.orchestrator.registry().list_models() {
        Ok(models) => {
            info!(count = models.len(), "listing models");
            Ok(Json(ModelsResponse {
                success: true,
                message: format!("Found {} available models", models.len()),
                models,
            }))
        }
        Err(EaselError::NotFound(_)) => {
            warn!(root = %state.orchestrator.registry().root().display(), "models directory not found");
            Ok(Json(ModelsResponse {
                success: false,
                models: Vec::new(),
                message: "Models directory not found".to_string(),
            }))
        }
        Err(e) => Err(ServerError::Internal(format!("failed to list models: {e}"))),
    }
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ModelDescriptor>, ServerError> {
    // Hidden entries are never models; this also keeps `..` out of the root.
    if name.starts_with('.') {
        return Err(ServerError::NotFound(format!("Model '{name}' not found")));
    }
    Ok(Json(state.orchestrator.registry().describe(&name)?))
}

pub async fn get_model_defaults(
    Path(name): Path<String>,
) -> Result<Json<GenerationDefaults>, ServerError> {
    if !has_model_defaults(&name) {
        return Err(ServerError::NotFound(format!(
            "No defaults available for model '{name}'"
        )));
    }
    Ok(Json(model_defaults(&name)))
}

pub async fn get_all_defaults() -> Json<AllDefaultsResponse> {
    let defaults = all_model_defaults();
    Json(AllDefaultsResponse {
        success: true,
        message: format!("Retrieved defaults for {} models", defaults.len()),
        defaults,
    })
}
