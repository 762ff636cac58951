use serde::{Deserialize, Serialize};

use crate::{EaselError, Result};

pub const DEFAULT_MODEL: &str = "sdxl-turbo";
pub const DEFAULT_SAMPLER: &str = "euler_a";

const MAX_PROMPT_CHARS: usize = 1000;

/// Text-to-image request as received over HTTP.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_size")]
    pub width: u32,
    #[serde(default = "default_size")]
    pub height: u32,
    #[serde(default = "default_text_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_text_guidance")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_model")]
    pub model_name: String,
    #[serde(default = "default_sampler")]
    pub sampler: String,
}

/// Image-to-image request; `image_data` is base64, optionally with a
/// `data:image/...;base64,` prefix.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ImageToImageRequest {
    pub prompt: String,
    pub image_data: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default = "default_image_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_image_guidance")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_model")]
    pub model_name: String,
    #[serde(default = "default_sampler")]
    pub sampler: String,
}

fn default_size() -> u32 {
    512
}
fn default_text_steps() -> u32 {
    6
}
fn default_text_guidance() -> f64 {
    1.0
}
fn default_image_steps() -> u32 {
    20
}
fn default_image_guidance() -> f64 {
    7.5
}
fn default_strength() -> f64 {
    0.75
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_sampler() -> String {
    DEFAULT_SAMPLER.to_string()
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: default_size(),
            height: default_size(),
            num_inference_steps: default_text_steps(),
            guidance_scale: default_text_guidance(),
            seed: None,
            model_name: default_model(),
            sampler: default_sampler(),
        }
    }

    /// Schema checks applied at the HTTP boundary.
    pub fn validate(&self) -> Result<()> {
        validate_prompt(&self.prompt)?;
        check_range("width", self.width, 64, 2048)?;
        check_range("height", self.height, 64, 2048)?;
        check_range("num_inference_steps", self.num_inference_steps, 1, 50)?;
        check_float("guidance_scale", self.guidance_scale, 0.1, 20.0)
    }
}

impl ImageToImageRequest {
    pub fn new(prompt: impl Into<String>, image_data: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_data: image_data.into(),
            negative_prompt: None,
            strength: default_strength(),
            num_inference_steps: default_image_steps(),
            guidance_scale: default_image_guidance(),
            seed: None,
            model_name: default_model(),
            sampler: default_sampler(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_prompt(&self.prompt)?;
        if self.image_data.trim().is_empty() {
            return Err(EaselError::InvalidInput("image_data must not be empty".into()));
        }
        if !self.strength.is_finite() || self.strength <= 0.0 || self.strength > 1.0 {
            return Err(EaselError::InvalidInput(format!(
                "strength ({}) must be in (0, 1]",
                self.strength
            )));
        }
        check_range("num_inference_steps", self.num_inference_steps, 1, 50)?;
        check_float("guidance_scale", self.guidance_scale, 0.1, 20.0)
    }
}

pub(crate) fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(EaselError::InvalidInput("prompt must not be empty".into()));
    }
    let chars = prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(EaselError::InvalidInput(format!(
            "prompt too long ({chars} chars); maximum is {MAX_PROMPT_CHARS}"
        )));
    }
    Ok(())
}

fn check_range(field: &str, value: u32, min: u32, max: u32) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(EaselError::InvalidInput(format!(
            "{field} ({value}) must be between {min} and {max}"
        )));
    }
    Ok(())
}

fn check_float(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || !(min..=max).contains(&value) {
        return Err(EaselError::InvalidInput(format!(
            "{field} ({value}) must be between {min} and {max}"
        )));
    }
    Ok(())
}
