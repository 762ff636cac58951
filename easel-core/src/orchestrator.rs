use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::lock_pipeline;
use crate::{
    decode_base64_image, detect_model_type, fit_image, make_progress_adapter, multiple_of_8,
    GenerationParams, GenerationRequest, Guidance, ImageToImageRequest, ModelRegistry,
    PipelineCache, PipelineFactory, ProgressSink, Result, TaskKind, STAGE_DECODING_INPUT,
    STAGE_LOADING, STAGE_LOADING_IMG2IMG, STAGE_POST_PROCESSING, STAGE_PREPARING,
    STAGE_PREPARING_IMG2IMG,
};

const TEXT_STEPS: (u32, u32) = (1, 24);
const TEXT_GUIDANCE: (f64, f64) = (0.5, 2.0);
const IMAGE_STEPS: (u32, u32) = (1, 50);
const IMAGE_GUIDANCE: (f64, f64) = (0.1, 20.0);
const IMAGE_STRENGTH: (f64, f64) = (0.1, 1.0);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub models_dir: PathBuf,
    pub outputs_dir: PathBuf,
    /// Prepended to the saved filename to form the public image URL.
    pub image_url_prefix: String,
}

impl OrchestratorConfig {
    pub fn new(models_dir: impl Into<PathBuf>, outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            outputs_dir: outputs_dir.into(),
            image_url_prefix: "/images/".to_string(),
        }
    }
}

/// Where a single generation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStage {
    Validating,
    ResolvingModel,
    LoadingPipeline,
    Preparing,
    Generating,
    PostProcessing,
    Complete,
    Failed,
}

/// A saved generation result.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GeneratedArtifact {
    pub filename: String,
    pub path: PathBuf,
    pub image_url: String,
    pub model: String,
    pub sampler: String,
    /// Seconds from request to saved file.
    pub generation_time: f64,
}

/// Stage labels reported to the sink, per task kind.
struct StageLabels {
    loading: &'static str,
    preparing: &'static str,
}

const TEXT_LABELS: StageLabels = StageLabels {
    loading: STAGE_LOADING,
    preparing: STAGE_PREPARING,
};
const IMAGE_LABELS: StageLabels = StageLabels {
    loading: STAGE_LOADING_IMG2IMG,
    preparing: STAGE_PREPARING_IMG2IMG,
};

/// Drives one generation from request to saved artifact.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: ModelRegistry,
    cache: PipelineCache,
    /// Held for the duration of every engine call; one generation per device.
    device_gate: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, factory: Arc<dyn PipelineFactory>) -> Self {
        Self {
            registry: ModelRegistry::new(config.models_dir.clone()),
            cache: PipelineCache::new(factory),
            config,
            device_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &PipelineCache {
        &self.cache
    }

    /// Pick the model to run for `task`, substituting a registry
    /// recommendation when the requested one is missing or unsuitable.
    pub fn resolve_model(&self, requested: &str, task: TaskKind) -> String {
        if self.registry.contains(requested)
            && self
                .registry
                .model_path(requested)
                .is_ok_and(|path| detect_model_type(&path).suits(task))
        {
            return requested.to_string();
        }

        if let Some(recommended) = self.registry.recommend_model_for_task(task) {
            warn!(
                requested,
                substitute = %recommended,
                task = %task,
                "requested model unavailable for task, using recommended model"
            );
            return recommended;
        }

        if task == TaskKind::ImageToImage {
            if let Some(recommended) = self
                .registry
                .recommend_model_for_task(TaskKind::TextToImage)
            {
                warn!(
                    requested,
                    substitute = %recommended,
                    "no image-to-image model found, using a text-to-image model"
                );
                return recommended;
            }
        }

        warn!(requested, task = %task, "no suitable model found, trying requested model as-is");
        requested.to_string()
    }

    /// Generate an image from text. Blocks for the whole generation.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn ProgressSink,
    ) -> Result<GeneratedArtifact> {
        let started = Instant::now();
        self.text_to_image(request, sink, started)
            .inspect_err(|e| failed(TaskKind::TextToImage, &request.model_name, e))
    }

    /// Generate an image from a base64 source image and text. Blocks for the
    /// whole generation.
    pub fn generate_img2img(
        &self,
        request: &ImageToImageRequest,
        sink: &mut dyn ProgressSink,
    ) -> Result<GeneratedArtifact> {
        let started = Instant::now();
        self.image_to_image(request, sink, started)
            .inspect_err(|e| failed(TaskKind::ImageToImage, &request.model_name, e))
    }

    fn text_to_image(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn ProgressSink,
        started: Instant,
    ) -> Result<GeneratedArtifact> {
        let task = TaskKind::TextToImage;
        transition(task, GenerationStage::Validating);
        request.validate()?;

        let steps = request.num_inference_steps.clamp(TEXT_STEPS.0, TEXT_STEPS.1) as usize;
        let params = GenerationParams {
            task,
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: multiple_of_8(request.width) as usize,
            height: multiple_of_8(request.height) as usize,
            steps,
            guidance: Guidance::Scale(
                request
                    .guidance_scale
                    .clamp(TEXT_GUIDANCE.0, TEXT_GUIDANCE.1),
            ),
            seed: request.seed,
            source: None,
            strength: None,
        };
        info!(
            model = %request.model_name,
            sampler = %request.sampler,
            width = params.width,
            height = params.height,
            steps,
            guidance = params.guidance.value(),
            "starting text-to-image generation"
        );

        transition(task, GenerationStage::ResolvingModel);
        let model = self.resolve_model(&request.model_name, task);
        self.execute(
            params,
            request.guidance_scale,
            &model,
            &request.sampler,
            &TEXT_LABELS,
            sink,
            started,
        )
    }

    fn image_to_image(
        &self,
        request: &ImageToImageRequest,
        sink: &mut dyn ProgressSink,
        started: Instant,
    ) -> Result<GeneratedArtifact> {
        let task = TaskKind::ImageToImage;
        transition(task, GenerationStage::Validating);
        request.validate()?;

        let steps = request
            .num_inference_steps
            .clamp(IMAGE_STEPS.0, IMAGE_STEPS.1) as usize;
        sink.report(0, steps, STAGE_DECODING_INPUT);
        let source = decode_base64_image(&request.image_data)?;
        let (width, height) = (multiple_of_8(source.width()), multiple_of_8(source.height()));
        let source = fit_image(source, width, height);

        let strength = request.strength.clamp(IMAGE_STRENGTH.0, IMAGE_STRENGTH.1);
        let params = GenerationParams {
            task,
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: width as usize,
            height: height as usize,
            steps,
            guidance: Guidance::Scale(
                request
                    .guidance_scale
                    .clamp(IMAGE_GUIDANCE.0, IMAGE_GUIDANCE.1),
            ),
            seed: request.seed,
            source: Some(source),
            strength: Some(strength),
        };
        info!(
            model = %request.model_name,
            sampler = %request.sampler,
            width,
            height,
            steps,
            strength,
            guidance = params.guidance.value(),
            "starting image-to-image generation"
        );

        transition(task, GenerationStage::ResolvingModel);
        let model = self.resolve_model(&request.model_name, task);
        self.execute(
            params,
            request.guidance_scale,
            &model,
            &request.sampler,
            &IMAGE_LABELS,
            sink,
            started,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        mut params: GenerationParams,
        raw_guidance: f64,
        model: &str,
        sampler: &str,
        labels: &StageLabels,
        sink: &mut dyn ProgressSink,
        started: Instant,
    ) -> Result<GeneratedArtifact> {
        let task = params.task;
        let steps = params.steps;

        let model_path = self.registry.model_path(model)?;

        // The gate covers the cache lookup as well as the run: replacing a
        // cached pipeline only happens once no generation holds the old one,
        // so a slot never has two handles alive.
        let image = {
            let _gate = self
                .device_gate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            transition(task, GenerationStage::LoadingPipeline);
            sink.report(0, steps, labels.loading);
            let pipeline = self.cache.get_or_build(task, model, &model_path, sampler)?;

            transition(task, GenerationStage::Preparing);
            sink.report(0, steps, labels.preparing);
            let mut pipeline = lock_pipeline(&pipeline)?;
            if pipeline.family().uses_true_cfg() {
                params.guidance = Guidance::TrueCfg(raw_guidance);
            }

            transition(task, GenerationStage::Generating);
            let mut adapter = make_progress_adapter(steps, sink, None);
            pipeline.run(&params, &mut adapter)?
        };

        transition(task, GenerationStage::PostProcessing);
        sink.report(steps, steps, STAGE_POST_PROCESSING);
        let artifact = self.save(&image, model, sampler, started)?;

        transition(task, GenerationStage::Complete);
        info!(
            task = %task,
            filename = %artifact.filename,
            generation_time = artifact.generation_time,
            "image generated"
        );
        Ok(artifact)
    }

    fn save(
        &self,
        image: &DynamicImage,
        model: &str,
        sampler: &str,
        started: Instant,
    ) -> Result<GeneratedArtifact> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let filename = artifact_filename(model, sampler, millis);

        fs::create_dir_all(&self.config.outputs_dir)?;
        let path = self.config.outputs_dir.join(&filename);
        image.save_with_format(&path, ImageFormat::Png)?;

        Ok(GeneratedArtifact {
            image_url: format!("{}{}", self.config.image_url_prefix, filename),
            filename,
            path,
            model: model.to_string(),
            sampler: sampler.to_string(),
            generation_time: started.elapsed().as_secs_f64(),
        })
    }
}

pub(crate) fn artifact_filename(model: &str, sampler: &str, millis: u128) -> String {
    let model = model.replace(['/', '\\'], "_");
    format!("{model}_{sampler}_{millis}.png")
}

fn transition(task: TaskKind, stage: GenerationStage) {
    debug!(task = %task, stage = ?stage, "generation stage");
}

fn failed(task: TaskKind, model: &str, e: &crate::EaselError) {
    error!(task = %task, model, stage = ?GenerationStage::Failed, error = %e, "generation failed");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::test::FakeFactory;
    use crate::registry::test::add_model;
    use crate::{
        BuildRequest, EaselError, EngineFamily, GenerationParams, Pipeline, PipelineFactory,
        SdVersion, StepArgs, StepCallback,
    };
    use base64::{prelude::BASE64_STANDARD, Engine};
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    struct Fixture {
        _dir: TempDir,
        models: PathBuf,
        outputs: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let models = dir.path().join("models");
        let outputs = dir.path().join("outputs");
        fs::create_dir_all(&models).unwrap();
        Fixture {
            _dir: dir,
            models,
            outputs,
        }
    }

    fn orchestrator(fx: &Fixture, factory: Arc<dyn PipelineFactory>) -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::new(&fx.models, &fx.outputs), factory)
    }

    fn record(seen: &mut Vec<(usize, usize, String)>) -> impl FnMut(usize, usize, &str) + '_ {
        move |c: usize, t: usize, s: &str| seen.push((c, t, s.to_string()))
    }

    fn png_base64(width: u32, height: u32) -> String {
        let mut bytes = Vec::new();
        DynamicImage::new_rgb8(width, height)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        BASE64_STANDARD.encode(&bytes)
    }

    #[test]
    fn text_to_image_happy_path() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let factory = Arc::new(FakeFactory::default());
        let orch = orchestrator(&fx, factory.clone());

        let mut request = GenerationRequest::new("a lighthouse at dusk");
        request.num_inference_steps = 4;
        let mut seen = Vec::new();
        let artifact = orch.generate(&request, &mut record(&mut seen)).unwrap();

        let stages: Vec<&str> = seen.iter().map(|(_, _, s)| s.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "Loading model",
                "Preparing generation",
                "Generating (step 1/4)",
                "Generating (step 2/4)",
                "Generating (step 3/4)",
                "Generating (step 4/4)",
                "Post-processing",
            ]
        );
        assert!(artifact.filename.starts_with("sdxl-turbo_euler_a_"));
        assert!(artifact.filename.ends_with(".png"));
        assert_eq!(artifact.image_url, format!("/images/{}", artifact.filename));
        assert!(artifact.path.exists());
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

        let saved = image::open(&artifact.path).unwrap();
        assert_eq!((saved.width(), saved.height()), (512, 512));
    }

    #[test]
    fn text_to_image_parameters_are_clamped() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));

        let mut request = GenerationRequest::new("tall");
        request.width = 300;
        request.height = 100;
        request.num_inference_steps = 40;
        let mut seen = Vec::new();
        let artifact = orch.generate(&request, &mut record(&mut seen)).unwrap();

        let generating = seen.iter().filter(|(_, _, s)| s.starts_with("Generating")).count();
        assert_eq!(generating, 24);
        assert!(seen.iter().all(|(_, total, _)| *total == 24));
        let saved = image::open(&artifact.path).unwrap();
        assert_eq!((saved.width(), saved.height()), (296, 256));
    }

    #[test]
    fn repeated_requests_reuse_the_pipeline() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let factory = Arc::new(FakeFactory::default());
        let orch = orchestrator(&fx, factory.clone());

        let request = GenerationRequest::new("twice");
        orch.generate(&request, &mut crate::NoProgress).unwrap();
        orch.generate(&request, &mut crate::NoProgress).unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[traced_test]
    fn missing_model_is_substituted_with_a_warning() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));

        let resolved = orch.resolve_model("does-not-exist", TaskKind::TextToImage);
        assert_eq!(resolved, "sdxl-turbo");
        assert!(logs_contain("using recommended model"));
    }

    #[test]
    #[traced_test]
    fn unresolvable_model_is_kept_as_is() {
        let fx = fixture();
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));
        assert_eq!(orch.resolve_model("ghost", TaskKind::ImageToImage), "ghost");
        assert!(logs_contain("no suitable model found"));
    }

    #[test]
    fn model_ids_with_separators_are_sanitized() {
        assert_eq!(
            artifact_filename("org/model\\v2", "ddim", 42),
            "org_model_v2_ddim_42.png"
        );

        let fx = fixture();
        add_model(&fx.models, "org/flux-mini", Some("FluxPipeline"));
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));
        let mut request = GenerationRequest::new("nested");
        request.model_name = "org/flux-mini".into();
        let artifact = orch.generate(&request, &mut crate::NoProgress).unwrap();
        assert!(artifact.filename.starts_with("org_flux-mini_euler_a_"));
        assert_eq!(artifact.path.parent(), Some(Path::new(&fx.outputs)));
    }

    #[test]
    fn invalid_image_fails_before_loading() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let factory = Arc::new(FakeFactory::default());
        let orch = orchestrator(&fx, factory.clone());

        let request = ImageToImageRequest::new("repaint", "definitely not base64!");
        let err = orch
            .generate_img2img(&request, &mut crate::NoProgress)
            .unwrap_err();
        assert!(matches!(err, EaselError::InvalidInput(_)));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn image_to_image_reports_its_stages() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));

        let mut request = ImageToImageRequest::new(
            "watercolor",
            format!("data:image/png;base64,{}", png_base64(300, 260)),
        );
        request.num_inference_steps = 2;
        let mut seen = Vec::new();
        let artifact = orch
            .generate_img2img(&request, &mut record(&mut seen))
            .unwrap();

        let stages: Vec<&str> = seen.iter().map(|(_, _, s)| s.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "Decoding input image",
                "Loading img2img model",
                "Preparing img2img generation",
                "Generating (step 1/2)",
                "Generating (step 2/2)",
                "Post-processing",
            ]
        );
        let saved = image::open(&artifact.path).unwrap();
        assert_eq!((saved.width(), saved.height()), (296, 256));
    }

    #[test]
    fn engine_errors_keep_their_kind() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let factory = Arc::new(FakeFactory {
            fail_with: Some(|| EaselError::NotFound("vae/diffusion_pytorch_model.safetensors".into())),
            ..FakeFactory::default()
        });
        let orch = orchestrator(&fx, factory);

        let err = orch
            .generate(&GenerationRequest::new("fails"), &mut crate::NoProgress)
            .unwrap_err();
        assert!(matches!(err, EaselError::NotFound(_)));
        assert!(!fx.outputs.exists() || fs::read_dir(&fx.outputs).unwrap().next().is_none());
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let fx = fixture();
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));
        let err = orch
            .generate(&GenerationRequest::new(""), &mut crate::NoProgress)
            .unwrap_err();
        assert!(matches!(err, EaselError::InvalidInput(_)));
    }

    #[test]
    #[traced_test]
    fn unsuitable_model_is_replaced_for_text_to_image() {
        let fx = fixture();
        add_model(&fx.models, "b-img2img", Some("StableDiffusionImg2ImgPipeline"));
        add_model(&fx.models, "c-sdxl", Some("StableDiffusionXLPipeline"));
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));

        let mut request = GenerationRequest::new("a harbor");
        request.model_name = "b-img2img".into();
        request.num_inference_steps = 2;
        let artifact = orch.generate(&request, &mut crate::NoProgress).unwrap();

        assert_eq!(artifact.model, "c-sdxl");
        assert!(artifact.filename.starts_with("c-sdxl_"));
        assert!(logs_contain("using recommended model"));
    }

    #[test]
    #[traced_test]
    fn image_to_image_falls_back_to_a_text_model() {
        let fx = fixture();
        add_model(&fx.models, "qwen-image", Some("QwenImagePipeline"));
        let orch = orchestrator(&fx, Arc::new(FakeFactory::default()));

        assert_eq!(orch.resolve_model("ghost", TaskKind::ImageToImage), "qwen-image");
        assert!(logs_contain("no image-to-image model found"));
    }

    #[test]
    fn escaping_model_names_are_rejected_before_loading() {
        let fx = fixture();
        let factory = Arc::new(FakeFactory::default());
        let orch = orchestrator(&fx, factory.clone());

        for name in ["../models", "/tmp"] {
            let mut request = GenerationRequest::new("escape");
            request.model_name = name.into();
            let err = orch.generate(&request, &mut crate::NoProgress).unwrap_err();
            assert!(matches!(err, EaselError::InvalidInput(_)), "{name}");
        }
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    /// Pipeline of a configurable family that records the guidance it ran with.
    struct GuidanceRecorder {
        family: EngineFamily,
        seen: Arc<Mutex<Vec<Guidance>>>,
    }

    impl Pipeline for GuidanceRecorder {
        fn family(&self) -> EngineFamily {
            self.family.clone()
        }

        fn run(
            &mut self,
            params: &GenerationParams,
            _callback: &mut dyn StepCallback,
        ) -> anyhow::Result<DynamicImage> {
            self.seen.lock().unwrap().push(params.guidance);
            Ok(DynamicImage::new_rgb8(params.width as u32, params.height as u32))
        }
    }

    struct GuidanceFactory {
        family: EngineFamily,
        seen: Arc<Mutex<Vec<Guidance>>>,
    }

    impl PipelineFactory for GuidanceFactory {
        fn build(&self, _request: &BuildRequest) -> Result<Box<dyn Pipeline>> {
            Ok(Box::new(GuidanceRecorder {
                family: self.family.clone(),
                seen: self.seen.clone(),
            }))
        }
    }

    #[test]
    fn true_cfg_family_gets_the_unclamped_scale() {
        let fx = fixture();
        add_model(&fx.models, "qwen-image", Some("QwenImagePipeline"));
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));

        let mut request = GenerationRequest::new("a tea house");
        request.guidance_scale = 5.0;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let orch = orchestrator(
            &fx,
            Arc::new(GuidanceFactory {
                family: EngineFamily::QwenImage,
                seen: seen.clone(),
            }),
        );
        request.model_name = "qwen-image".into();
        orch.generate(&request, &mut crate::NoProgress).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Guidance::TrueCfg(5.0)]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let orch = orchestrator(
            &fx,
            Arc::new(GuidanceFactory {
                family: EngineFamily::StableDiffusion(SdVersion::Turbo),
                seen: seen.clone(),
            }),
        );
        request.model_name = "sdxl-turbo".into();
        orch.generate(&request, &mut crate::NoProgress).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Guidance::Scale(2.0)]);
    }

    /// Tracks how many pipelines are alive at once.
    #[derive(Default)]
    struct Liveness {
        live: AtomicUsize,
        peak: AtomicUsize,
        builds: AtomicUsize,
    }

    struct SlowPipeline {
        liveness: Arc<Liveness>,
        step_time: Duration,
    }

    impl Drop for SlowPipeline {
        fn drop(&mut self) {
            self.liveness.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Pipeline for SlowPipeline {
        fn family(&self) -> EngineFamily {
            EngineFamily::StableDiffusion(SdVersion::Turbo)
        }

        fn run(
            &mut self,
            params: &GenerationParams,
            callback: &mut dyn StepCallback,
        ) -> anyhow::Result<DynamicImage> {
            for step in 0..params.steps {
                thread::sleep(self.step_time);
                callback.on_step(StepArgs::Keyword {
                    step: Some(step),
                    timestep: None,
                });
            }
            Ok(DynamicImage::new_rgb8(params.width as u32, params.height as u32))
        }
    }

    struct SlowFactory {
        liveness: Arc<Liveness>,
    }

    impl PipelineFactory for SlowFactory {
        fn build(&self, _request: &BuildRequest) -> Result<Box<dyn Pipeline>> {
            self.liveness.builds.fetch_add(1, Ordering::SeqCst);
            let live = self.liveness.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.liveness.peak.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(SlowPipeline {
                liveness: self.liveness.clone(),
                step_time: Duration::from_millis(30),
            }))
        }
    }

    #[test]
    fn switching_samplers_mid_generation_keeps_one_pipeline_alive() {
        let fx = fixture();
        add_model(&fx.models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let liveness = Arc::new(Liveness::default());
        let orch = orchestrator(
            &fx,
            Arc::new(SlowFactory {
                liveness: liveness.clone(),
            }),
        );

        let mut first = GenerationRequest::new("first");
        first.num_inference_steps = 10;
        let mut second = GenerationRequest::new("second");
        second.num_inference_steps = 2;
        second.sampler = "ddim".into();

        thread::scope(|scope| {
            let a = scope.spawn(|| orch.generate(&first, &mut crate::NoProgress));
            thread::sleep(Duration::from_millis(100));
            let b = scope.spawn(|| orch.generate(&second, &mut crate::NoProgress));
            a.join().unwrap().unwrap();
            b.join().unwrap().unwrap();
        });

        assert_eq!(liveness.builds.load(Ordering::SeqCst), 2);
        assert_eq!(liveness.peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            orch.cache().loaded(TaskKind::TextToImage).map(|k| k.sampler),
            Some("ddim".to_string())
        );
    }
}
