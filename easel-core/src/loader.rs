use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::{BuildRequest, ComputeDevice, EaselError, Pipeline};

/// Loads one engine family from a local model directory.
pub trait Loader {
    type Variant;
    type Model: Pipeline + 'static;

    fn load(
        variant: Self::Variant,
        request: &BuildRequest,
        device: &ComputeDevice,
    ) -> Result<Self::Model>
    where
        Self: Sized;
}

/// The first of `candidates` that exists in `dir`.
pub(crate) fn find_file(dir: &Path, candidates: &[&str]) -> Result<PathBuf> {
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            EaselError::NotFound(format!(
                "none of [{}] found in {}",
                candidates.join(", "),
                dir.display()
            ))
            .into()
        })
}

/// Weight file names to try, half precision first when running in it.
pub(crate) fn weight_candidates(stem: &'static str, dtype: DType) -> Vec<String> {
    let full = format!("{stem}.safetensors");
    let half = format!("{stem}.fp16.safetensors");
    if dtype == DType::F16 {
        vec![half, full]
    } else {
        vec![full, half]
    }
}

pub(crate) fn find_weights(dir: &Path, stem: &'static str, dtype: DType) -> Result<PathBuf> {
    let candidates = weight_candidates(stem, dtype);
    let candidates: Vec<&str> = candidates.iter().map(String::as_str).collect();
    find_file(dir, &candidates)
}

pub(crate) fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed to load tokenizer {}", path.display()))
}

pub(crate) fn mmap_weights(
    files: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: weight files are not modified while the process has them mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device) };
    vb.with_context(|| format!("failed to map weights {files:?}"))
}

/// Seed the accelerator generator when a seed was supplied. The CPU backend
/// has no seedable generator; seeded runs draw their noise through
/// [`initial_noise`] instead.
pub(crate) fn seed_device(device: &Device, seed: Option<u64>) {
    let Some(seed) = seed else {
        return;
    };
    if device.is_cpu() {
        debug!(seed, "cpu run, initial noise is drawn from a seeded host generator");
        return;
    }
    if let Err(e) = device.set_seed(seed) {
        warn!(seed, error = %e, "device cannot be seeded, sampler noise is nondeterministic");
    }
}

/// Standard normal noise of shape `dims` on `device`, in F32.
///
/// With a seed the values come from a host generator seeded with it, so the
/// same seed gives the same noise on every backend.
pub(crate) fn initial_noise(dims: &[usize], seed: Option<u64>, device: &Device) -> Result<Tensor> {
    let Some(seed) = seed else {
        return Ok(Tensor::randn(0f32, 1f32, dims, device)?);
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let count = dims.iter().product::<usize>();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, dims, &Device::Cpu)?.to_device(device)?)
}
