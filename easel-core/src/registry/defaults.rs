//! Recommended generation parameters per model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub guidance_scale: f64,
    pub num_inference_steps: u32,
    pub width: u32,
    pub height: u32,
    pub sampler: String,
    pub explanation: String,
}

const SDXL_TURBO: &str = "sdxl-turbo";
const FLUX: &str = "FLUX";

fn entry(
    guidance_scale: f64,
    num_inference_steps: u32,
    size: u32,
    sampler: &str,
    explanation: &str,
) -> GenerationDefaults {
    GenerationDefaults {
        guidance_scale,
        num_inference_steps,
        width: size,
        height: size,
        sampler: sampler.to_string(),
        explanation: explanation.to_string(),
    }
}

fn sdxl_turbo_defaults() -> GenerationDefaults {
    entry(
        1.0,
        6,
        512,
        "lcm",
        "SDXL-Turbo is optimized for fast generation with minimal steps. Uses low guidance scale (1.0) and LCM sampler for best results.",
    )
}

fn flux_defaults() -> GenerationDefaults {
    entry(
        2.0,
        12,
        1024,
        "flowmatch",
        "FLUX is a high-quality diffusion model optimized for fast generation. Uses low CFG (2.0) and moderate steps (12) for best results.",
    )
}

/// Every built-in entry, keyed by model name.
pub fn all_model_defaults() -> BTreeMap<String, GenerationDefaults> {
    BTreeMap::from([
        (SDXL_TURBO.to_string(), sdxl_turbo_defaults()),
        (
            "sdxl-base-1.0".to_string(),
            entry(
                7.5,
                25,
                1024,
                "euler",
                "SDXL Base provides high-quality images with more detail. Requires higher guidance scale (7.5) and more steps for optimal results.",
            ),
        ),
        (
            "qwen-image".to_string(),
            entry(
                5.0,
                20,
                768,
                "flowmatch",
                "Qwen-Image is a versatile model that balances quality and speed. Works well with moderate guidance scale and Match Euler sampler.",
            ),
        ),
        (FLUX.to_string(), flux_defaults()),
    ])
}

/// Defaults for `model_name`: the exact entry, else the FLUX entry for any
/// name containing "flux", else the SDXL-Turbo entry.
pub fn model_defaults(model_name: &str) -> GenerationDefaults {
    if let Some(defaults) = all_model_defaults().remove(model_name) {
        return defaults;
    }
    if model_name.to_lowercase().contains("flux") {
        flux_defaults()
    } else {
        sdxl_turbo_defaults()
    }
}

/// Whether an exact entry exists for `model_name`.
pub fn has_model_defaults(model_name: &str) -> bool {
    all_model_defaults().contains_key(model_name)
}
