use serde::{Deserialize, Serialize};

use crate::TaskKind;

pub const STAGE_LOADING: &str = "Loading model";
pub const STAGE_PREPARING: &str = "Preparing generation";
pub const STAGE_DECODING_INPUT: &str = "Decoding input image";
pub const STAGE_LOADING_IMG2IMG: &str = "Loading img2img model";
pub const STAGE_PREPARING_IMG2IMG: &str = "Preparing img2img generation";
pub const STAGE_POST_PROCESSING: &str = "Post-processing";
pub const STAGE_COMPLETED: &str = "Completed";

/// One event on a generation progress stream.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        step: usize,
        total_steps: usize,
        stage: String,
        /// Percent complete, 0 to 100.
        progress: f64,
    },
    Complete {
        filename: String,
        image_url: String,
        generation_time: f64,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }

    /// JSON body of the SSE `data:` line carrying this event.
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "message": format!("unserializable event: {e}") })
                .to_string()
        })
    }
}

/// Maps stage labels to a percentage for one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressScale {
    task: TaskKind,
}

impl ProgressScale {
    pub fn for_task(task: TaskKind) -> Self {
        Self { task }
    }

    pub fn percent(&self, step: usize, total: usize, stage: &str) -> f64 {
        let fraction = if total == 0 {
            0.0
        } else {
            (step as f64 / total as f64).min(1.0)
        };
        match (self.task, stage) {
            (_, STAGE_POST_PROCESSING) => 95.0,
            (_, STAGE_COMPLETED) => 100.0,
            (TaskKind::TextToImage, STAGE_LOADING) => 5.0,
            (TaskKind::TextToImage, STAGE_PREPARING) => 10.0,
            (TaskKind::TextToImage, s) if s.starts_with("Generating") => 10.0 + fraction * 80.0,
            (TaskKind::ImageToImage, STAGE_DECODING_INPUT) => 5.0,
            (TaskKind::ImageToImage, STAGE_LOADING_IMG2IMG) => 10.0,
            (TaskKind::ImageToImage, STAGE_PREPARING_IMG2IMG) => 15.0,
            (TaskKind::ImageToImage, s) if s.starts_with("Generating") => {
                15.0 + (fraction * 75.0).trunc()
            }
            _ => 0.0,
        }
    }

    pub fn event(&self, step: usize, total: usize, stage: &str) -> ProgressEvent {
        ProgressEvent::Progress {
            step,
            total_steps: total,
            stage: stage.to_string(),
            progress: self.percent(step, total, stage),
        }
    }
}
