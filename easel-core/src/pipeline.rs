use std::fmt;
use std::path::PathBuf;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{Result, StepCallback};

/// The two supported generation modes.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TextToImage,
    ImageToImage,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::TextToImage => f.write_str("text-to-image"),
            TaskKind::ImageToImage => f.write_str("image-to-image"),
        }
    }
}

/// How strongly generation follows the prompt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guidance {
    /// The usual `guidance_scale`.
    Scale(f64),
    /// "True" classifier-free guidance, used by Qwen-Image.
    TrueCfg(f64),
}

impl Guidance {
    pub fn value(&self) -> f64 {
        match self {
            Guidance::Scale(v) | Guidance::TrueCfg(v) => *v,
        }
    }
}

/// Engine input after validation, clamping and model resolution.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub task: TaskKind,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: Guidance,
    pub seed: Option<u64>,
    /// Source image for image-to-image, already RGB and `width`×`height`.
    pub source: Option<DynamicImage>,
    /// Fraction of the denoising trajectory applied to `source`.
    pub strength: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdVersion {
    V1_5,
    V2_1,
    Xl,
    Turbo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

/// Shape of the per-step callback an engine family invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackConvention {
    /// `(step_index, timestep, latents)`
    Positional,
    /// `(engine, step_index, side_channel)`; the side channel is handed back.
    SideChannel,
    /// Keyword arguments only; the step may be missing.
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EngineFamily {
    StableDiffusion(SdVersion),
    Flux(FluxVariant),
    QwenImage,
    Unsupported(String),
}

impl EngineFamily {
    pub fn callback_convention(&self) -> CallbackConvention {
        match self {
            EngineFamily::StableDiffusion(_) => CallbackConvention::Positional,
            EngineFamily::Flux(_) | EngineFamily::QwenImage => CallbackConvention::SideChannel,
            EngineFamily::Unsupported(_) => CallbackConvention::Keyword,
        }
    }

    /// Families that take a true classifier-free-guidance scale instead of
    /// `guidance_scale`.
    pub fn uses_true_cfg(&self) -> bool {
        matches!(self, EngineFamily::QwenImage)
    }
}

/// Memory-saving switches applied when a pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    pub attention_slicing: bool,
    pub vae_slicing: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            attention_slicing: true,
            vae_slicing: true,
        }
    }
}

/// Everything a [`PipelineFactory`] needs to construct a handle.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub task: TaskKind,
    pub model_name: String,
    pub model_path: PathBuf,
    pub sampler: String,
    pub memory: MemoryOptions,
}

/// A loaded model with its configured sampler, ready to generate.
pub trait Pipeline: Send {
    fn family(&self) -> EngineFamily;

    /// Run one generation, invoking `callback` once per denoising step in the
    /// family's [`CallbackConvention`].
    fn run(
        &mut self,
        params: &GenerationParams,
        callback: &mut dyn StepCallback,
    ) -> anyhow::Result<DynamicImage>;
}

/// Builds [`Pipeline`] handles. Construction is expensive; callers go through
/// the [`PipelineCache`](crate::PipelineCache).
pub trait PipelineFactory: Send + Sync {
    fn build(&self, request: &BuildRequest) -> Result<Box<dyn Pipeline>>;
}
