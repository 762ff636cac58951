use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{PredictionType, SchedulerConfig, TimestepSpacing},
    uni_pc::UniPCSchedulerConfig,
};

use crate::SdVersion;

/// Samplers that can replace a model's built-in scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    EulerAncestral,
    Ddim,
    /// Second-order multistep solver, served for `dpmpp_2m` requests.
    Multistep,
}

impl Sampler {
    /// `None` for ids with no candle scheduler; the model default is kept.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_lowercase().as_str() {
            "euler_a" | "euler_ancestral" => Some(Sampler::EulerAncestral),
            "ddim" => Some(Sampler::Ddim),
            "dpmpp_2m" | "unipc" => Some(Sampler::Multistep),
            _ => None,
        }
    }

    /// Scheduler configuration carrying over the version's prediction type
    /// and timestep spacing.
    pub fn config(self, version: SdVersion) -> Box<dyn SchedulerConfig> {
        let prediction_type = match version {
            SdVersion::V2_1 => PredictionType::VPrediction,
            _ => PredictionType::Epsilon,
        };
        let timestep_spacing = match version {
            SdVersion::Turbo => TimestepSpacing::Trailing,
            _ => TimestepSpacing::Leading,
        };

        match self {
            Sampler::EulerAncestral => Box::new(EulerAncestralDiscreteSchedulerConfig {
                prediction_type,
                timestep_spacing,
                ..Default::default()
            }),
            Sampler::Ddim => Box::new(DDIMSchedulerConfig {
                prediction_type,
                timestep_spacing,
                ..Default::default()
            }),
            Sampler::Multistep => Box::new(UniPCSchedulerConfig {
                prediction_type,
                ..Default::default()
            }),
        }
    }
}
