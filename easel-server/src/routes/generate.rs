//! Blocking (non-streaming) text-to-image generation.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use easel_core::{GenerationRequest, NoProgress};
use serde::Serialize;
use tracing::info;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Serialize, Debug)]
pub struct GenerationResponse {
    pub success: bool,
    pub image_url: String,
    pub message: String,
    pub filename: String,
    pub generation_time: f64,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/generate", post(generate_image))
}

pub async fn generate_image(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ServerError> {
    request.validate()?;
    info!(
        model = %request.model_name,
        sampler = %request.sampler,
        width = request.width,
        height = request.height,
        steps = request.num_inference_steps,
        seeded = request.seed.is_some(),
        "generation request"
    );

    let orchestrator = state.orchestrator.clone();
    let artifact =
        tokio::task::spawn_blocking(move || orchestrator.generate(&request, &mut NoProgress))
            .await
            .map_err(|e| ServerError::Internal(format!("generation task failed: {e}")))??;

    Ok(Json(GenerationResponse {
        success: true,
        image_url: artifact.image_url,
        message: "Image generated successfully".to_string(),
        filename: artifact.filename,
        generation_time: artifact.generation_time,
    }))
}
