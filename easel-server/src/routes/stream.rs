//! Server-sent progress streams for text-to-image and image-to-image.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use easel_core::{stream_generation, GenerationJob, GenerationRequest, ImageToImageRequest};
use futures::StreamExt;
use tracing::info;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate-stream", post(generate_stream))
        .route("/generate-img2img-stream", post(generate_img2img_stream))
}

pub async fn generate_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<impl IntoResponse, ServerError> {
    request.validate()?;
    info!(model = %request.model_name, sampler = %request.sampler, "streaming generation request");
    Ok(progress_response(&state, GenerationJob::TextToImage(request)))
}

pub async fn generate_img2img_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImageToImageRequest>,
) -> Result<impl IntoResponse, ServerError> {
    request.validate()?;
    info!(
        model = %request.model_name,
        sampler = %request.sampler,
        strength = request.strength,
        "streaming img2img request"
    );
    Ok(progress_response(&state, GenerationJob::ImageToImage(request)))
}

fn progress_response(state: &AppState, job: GenerationJob) -> impl IntoResponse {
    let events = stream_generation(state.orchestrator.clone(), job, state.bridge)
        .map(|event| Ok::<Event, Infallible>(Event::default().data(event.to_sse_data())));
    ([(header::CACHE_CONTROL, "no-cache")], Sse::new(events))
}
