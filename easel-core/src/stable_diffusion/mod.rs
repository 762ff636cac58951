use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod sampler;

pub use sampler::Sampler;

use crate::{
    decoded_to_image, find_file, find_weights, image_to_tensor, initial_noise, load_tokenizer,
    seed_device, BuildRequest, ComputeDevice, EngineFamily, GenerationParams, Loader, Pipeline,
    SdVersion, StepArgs, StepCallback,
};

/// Rows per attention slice when attention slicing is enabled.
const ATTENTION_SLICE_SIZE: usize = 4;

/// One text encoder with its tokenizer and padding settings.
struct TextEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    config: clip::Config,
}

impl TextEncoder {
    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let pad = self.config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *self
            .tokenizer
            .get_vocab(true)
            .get(pad)
            .with_context(|| format!("tokenizer has no padding token {pad}"))?;

        let max_len = self.config.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            debug!(tokens = tokens.len(), max_len, "prompt truncated to the text encoder limit");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct StableDiffusionModel {
    version: SdVersion,
    config: StableDiffusionConfig,
    /// `None` keeps the scheduler the model ships with.
    scheduler: Option<Box<dyn SchedulerConfig>>,
    device: Device,
    dtype: DType,
    encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn vae_scale(&self) -> f64 {
        match self.version {
            SdVersion::Xl | SdVersion::Turbo => 0.13025,
            SdVersion::V1_5 | SdVersion::V2_1 => 0.18215,
        }
    }

    fn build_scheduler(&self, steps: usize) -> Result<Box<dyn Scheduler>> {
        Ok(match &self.scheduler {
            Some(config) => config.build(steps)?,
            None => self.config.build_scheduler(steps)?,
        })
    }

    /// Conditioning for every encoder concatenated on the feature axis, with
    /// the unconditional embedding stacked in front when guiding.
    fn text_embeddings(&self, prompt: &str, negative: &str, guide: bool) -> Result<Tensor> {
        let mut per_encoder = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let cond = encoder.encode(prompt, &self.device)?;
            let embeddings = if guide {
                let uncond = encoder.encode(negative, &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            per_encoder.push(embeddings.to_dtype(self.dtype)?);
        }
        Ok(Tensor::cat(&per_encoder, candle_core::D::Minus1)?)
    }
}

impl Pipeline for StableDiffusionModel {
    fn family(&self) -> EngineFamily {
        EngineFamily::StableDiffusion(self.version)
    }

    fn run(
        &mut self,
        params: &GenerationParams,
        callback: &mut dyn StepCallback,
    ) -> Result<DynamicImage> {
        let guidance = params.guidance.value();
        let guide = guidance > 1.0;
        seed_device(&self.device, params.seed);

        let mut scheduler = self.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let embeddings = self.text_embeddings(
            &params.prompt,
            params.negative_prompt.as_deref().unwrap_or_default(),
            guide,
        )?;
        let vae_scale = self.vae_scale();

        let (mut latents, t_start) = match &params.source {
            Some(source) => {
                let strength = params.strength.unwrap_or(1.0);
                let t_start = params.steps - (params.steps as f64 * strength) as usize;
                let image = image_to_tensor(source, &self.device, self.dtype)?;
                let latents = (self.vae.encode(&image)?.sample()? * vae_scale)?;
                let latents = match timesteps.get(t_start) {
                    Some(&timestep) => {
                        let noise = initial_noise(latents.dims(), params.seed, &self.device)?
                            .to_dtype(latents.dtype())?;
                        scheduler.add_noise(&latents, noise, timestep)?
                    }
                    None => latents,
                };
                (latents, t_start)
            }
            None => {
                let dims = [1, 4, params.height / 8, params.width / 8];
                let noise = initial_noise(&dims, params.seed, &self.device)?;
                ((noise * scheduler.init_noise_sigma())?, 0)
            }
        };
        latents = latents.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let input = if guide {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, &embeddings)?;
            let noise_pred = if guide {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            callback.on_step(StepArgs::Positional {
                step: index - t_start,
                timestep: timestep as f64,
                latents: &latents,
            });
        }

        let decoded = self.vae.decode(&(&latents / vae_scale)?)?;
        decoded_to_image(&decoded)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Variant = SdVersion;
    type Model = StableDiffusionModel;

    fn load(
        version: SdVersion,
        request: &BuildRequest,
        device: &ComputeDevice,
    ) -> Result<Self::Model> {
        let root = &request.model_path;
        let dtype = device.dtype;
        let xl = matches!(version, SdVersion::Xl | SdVersion::Turbo);

        // Locate everything before loading anything.
        let unet_file = find_weights(&root.join("unet"), "diffusion_pytorch_model", dtype)?;
        let vae_file = find_weights(&root.join("vae"), "diffusion_pytorch_model", dtype)?;
        let mut encoder_files = vec![(
            find_file(&root.join("tokenizer"), &["tokenizer.json"])?,
            find_weights(&root.join("text_encoder"), "model", dtype)?,
        )];
        if xl {
            encoder_files.push((
                find_file(&root.join("tokenizer_2"), &["tokenizer.json"])?,
                find_weights(&root.join("text_encoder_2"), "model", dtype)?,
            ));
        }

        let slice = request.memory.attention_slicing.then_some(ATTENTION_SLICE_SIZE);
        let config = match version {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(slice, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(slice, None, None),
            SdVersion::Xl => StableDiffusionConfig::sdxl(slice, None, None),
            SdVersion::Turbo => StableDiffusionConfig::sdxl_turbo(slice, None, None),
        };
        if request.memory.vae_slicing {
            debug!("vae slicing requested, batches are single images so decoding is unsliced");
        }

        let clip_configs = std::iter::once(config.clip.clone()).chain(config.clip2.clone());
        let mut encoders = Vec::with_capacity(encoder_files.len());
        for ((tokenizer_file, weights), clip_config) in encoder_files.into_iter().zip(clip_configs) {
            // Text encoders run in full precision; embeddings are cast afterwards.
            let model = stable_diffusion::build_clip_transformer(
                &clip_config,
                &weights,
                &device.device,
                DType::F32,
            )
            .with_context(|| format!("failed to load text encoder {}", weights.display()))?;
            encoders.push(TextEncoder {
                tokenizer: load_tokenizer(&tokenizer_file)?,
                model,
                config: clip_config,
            });
        }

        let use_flash_attn = cfg!(feature = "flash-attn");
        let unet = config
            .build_unet(&unet_file, &device.device, 4, use_flash_attn, dtype)
            .context("failed to load unet")?;
        let vae = config
            .build_vae(&vae_file, &device.device, dtype)
            .context("failed to load vae")?;

        let scheduler = match Sampler::from_id(&request.sampler) {
            Some(sampler) => Some(sampler.config(version)),
            None => {
                debug!(sampler = %request.sampler, "unknown sampler, keeping the model scheduler");
                None
            }
        };

        info!(
            model = %request.model_name,
            version = ?version,
            dtype = ?dtype,
            device = %device.kind,
            "stable diffusion pipeline ready"
        );
        Ok(StableDiffusionModel {
            version,
            config,
            scheduler,
            device: device.device.clone(),
            dtype,
            encoders,
            unet,
            vae,
        })
    }
}
