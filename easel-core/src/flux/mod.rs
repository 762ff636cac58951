use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        self,
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        WithForward,
    },
    t5::{self, T5EncoderModel},
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    decoded_to_image, find_file, find_weights, fit_image, image_to_tensor, initial_noise,
    load_tokenizer, mmap_weights, seed_device, BuildRequest, ComputeDevice, EaselError, EngineFamily,
    FluxVariant, GenerationParams, Loader, Pipeline, StepArgs, StepCallback, StepState,
};

const T5_MAX_TOKENS: usize = 256;

/// Packed latents need both image sides divisible by 16.
fn packed_size(width: usize, height: usize) -> (usize, usize) {
    ((width / 16 * 16).max(16), (height / 16 * 16).max(16))
}

/// Latent noise shape for an image, as `flux::sampling::get_noise` lays it out.
fn noise_dims(width: usize, height: usize) -> [usize; 4] {
    [1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2]
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn t5_embedding(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_MAX_TOKENS, 0);
        let ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.t5_model.forward(&ids)?)
    }

    fn clip_embedding(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&ids)?)
    }
}

impl Pipeline for FluxModel {
    fn family(&self) -> EngineFamily {
        EngineFamily::Flux(self.variant)
    }

    fn run(
        &mut self,
        params: &GenerationParams,
        callback: &mut dyn StepCallback,
    ) -> Result<DynamicImage> {
        let (width, height) = packed_size(params.width, params.height);
        if params.negative_prompt.is_some() {
            debug!("flux ignores negative prompts");
        }
        seed_device(&self.device, params.seed);

        let t5_emb = self.t5_embedding(&params.prompt)?;
        let clip_emb = self.clip_embedding(&params.prompt)?;
        let noise = initial_noise(&noise_dims(width, height), params.seed, &self.device)?
            .to_dtype(self.dtype)?;
        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => flux::sampling::get_schedule(params.steps, None),
            FluxVariant::Dev => {
                flux::sampling::get_schedule(params.steps, Some((state.img.dim(1)?, 0.5, 1.15)))
            }
        };

        // Image-to-image starts part way down the schedule from the encoded
        // source blended with noise at that timestep.
        let (state, t_start) = match &params.source {
            Some(source) => {
                let strength = params.strength.unwrap_or(1.0);
                let t_start = params.steps - (params.steps as f64 * strength) as usize;
                let t = timesteps[t_start.min(timesteps.len() - 1)];
                let source = fit_image(source.clone(), width as u32, height as u32);
                let image = image_to_tensor(&source, &self.device, self.dtype)?;
                let clean = self.autoencoder.encode(&image)?;
                let noisy = ((&noise * t)? + (clean * (1.0 - t))?)?;
                (flux::sampling::State::new(&t5_emb, &clip_emb, &noisy)?, t_start)
            }
            None => (state, 0),
        };

        let b_sz = state.img.dim(0)?;
        let guidance = Tensor::full(params.guidance.value() as f32, b_sz, &self.device)?;
        let mut img = state.img.clone();
        for (index, window) in timesteps[t_start..].windows(2).enumerate() {
            let (t_curr, t_prev) = (window[0], window[1]);
            let t_vec = Tensor::full(t_curr as f32, b_sz, &self.device)?;
            let pred = self.flux_model.forward(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?;
            img = (img + (pred * (t_prev - t_curr))?)?;

            let returned = callback.on_step(StepArgs::SideChannel {
                step: index,
                state: StepState {
                    latents: img.clone(),
                    timestep: t_prev,
                },
            });
            if let Some(returned) = returned {
                img = returned.latents;
            }
        }

        let unpacked = flux::sampling::unpack(&img, height, width)?;
        let decoded = self.autoencoder.decode(&unpacked)?;
        decoded_to_image(&decoded)
    }
}

/// Every `.safetensors` shard in `dir`, sorted.
fn shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                files.push(path);
            }
        }
    }
    if files.is_empty() {
        return Err(EaselError::NotFound(format!("no safetensors weights in {}", dir.display())).into());
    }
    files.sort();
    Ok(files)
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Variant = FluxVariant;
    type Model = FluxModel;

    fn load(
        variant: FluxVariant,
        request: &BuildRequest,
        device: &ComputeDevice,
    ) -> Result<Self::Model> {
        let root = &request.model_path;
        let dtype = device.device.bf16_default_to_f32();
        let device_kind = device.kind;
        let device = device.device.clone();

        let flux_file = match variant {
            FluxVariant::Schnell => find_file(root, &["flux1-schnell.safetensors"])?,
            FluxVariant::Dev => find_file(root, &["flux1-dev.safetensors"])?,
        };
        let autoencoder_file = find_file(root, &["ae.safetensors", "vae/ae.safetensors"])?;
        let clip_file = find_weights(&root.join("text_encoder"), "model", dtype)?;
        let clip_tokenizer_file = find_file(&root.join("tokenizer"), &["tokenizer.json"])?;
        let t5_files = shards(&root.join("text_encoder_2"))?;
        let t5_config_file = find_file(&root.join("text_encoder_2"), &["config.json"])?;
        let t5_tokenizer_file = find_file(&root.join("tokenizer_2"), &["tokenizer.json"])?;

        // --- T5 ---
        let t5_config = fs::read_to_string(&t5_config_file).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&t5_config).context("failed to parse T5 config")?;
        let t5_vb = mmap_weights(&t5_files, dtype, &device)?;
        let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = load_tokenizer(&t5_tokenizer_file)?;

        // --- CLIP ---
        let clip_vb = mmap_weights(&[clip_file], dtype, &device)?;
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = load_tokenizer(&clip_tokenizer_file)?;

        // --- Autoencoder ---
        let autoencoder_config = match variant {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        };
        let autoencoder_vb = mmap_weights(&[autoencoder_file], dtype, &device)?;
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Flux transformer ---
        let flux_config = match variant {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        };
        let flux_vb = mmap_weights(&[flux_file], dtype, &device)?;
        let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        if request.memory.attention_slicing || request.memory.vae_slicing {
            debug!("flux attention and vae run unsliced");
        }
        info!(
            model = %request.model_name,
            variant = ?variant,
            dtype = ?dtype,
            device = %device_kind,
            "flux pipeline ready"
        );

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}
