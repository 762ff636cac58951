use std::path::Path;

use tracing::info;

use crate::{
    detect_model_type, process_device, BuildRequest, ComputeDevice, DeviceMap, EaselError,
    EngineFamily, FluxLoader, FluxVariant, Loader, Manifest, ModelCapability, Pipeline,
    PipelineFactory, Result, SdVersion, StableDiffusionLoader, MANIFEST_FILE,
};

/// Decide which engine family serves the model at `model_dir`, from its
/// manifest class name and folder name.
pub fn detect_engine_family(model_dir: &Path) -> EngineFamily {
    let capability = detect_model_type(model_dir);
    let name = model_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let class = Manifest::read(model_dir)
        .ok()
        .and_then(|m| m.class_name)
        .unwrap_or_default();

    match capability {
        ModelCapability::QwenImage => EngineFamily::QwenImage,
        ModelCapability::FluxText => EngineFamily::Flux(if name.contains("dev") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        }),
        ModelCapability::FluxKontext
        | ModelCapability::Inpainting
        | ModelCapability::DepthToImage
        | ModelCapability::ControlNet => EngineFamily::Unsupported(capability.label().to_string()),
        ModelCapability::TextToImage
        | ModelCapability::ImageToImage
        | ModelCapability::TextToImageLikely => {
            let lower = class.to_lowercase();
            if ["pixart", "sd3", "stablediffusion3"].iter().any(|k| lower.contains(k)) {
                EngineFamily::Unsupported(class)
            } else {
                EngineFamily::StableDiffusion(sd_version(&class, &name))
            }
        }
    }
}

fn sd_version(class: &str, name: &str) -> SdVersion {
    if name.contains("turbo") {
        SdVersion::Turbo
    } else if class.contains("XL") || name.contains("xl") {
        SdVersion::Xl
    } else if ["2-1", "2.1", "v2"].iter().any(|k| name.contains(k)) {
        SdVersion::V2_1
    } else {
        SdVersion::V1_5
    }
}

/// Builds pipelines from local model directories with candle.
pub struct CandleFactory {
    device: ComputeDevice,
}

impl CandleFactory {
    pub fn new(device: ComputeDevice) -> Self {
        Self { device }
    }

    /// Factory on the process-wide device.
    pub fn from_device_map(device_map: DeviceMap) -> Self {
        Self::new(process_device(device_map).clone())
    }
}

impl PipelineFactory for CandleFactory {
    fn build(&self, request: &BuildRequest) -> Result<Box<dyn Pipeline>> {
        let manifest = request.model_path.join(MANIFEST_FILE);
        if !manifest.is_file() {
            return Err(EaselError::NotFound(format!(
                "{MANIFEST_FILE} not found at {}",
                manifest.display()
            )));
        }

        let family = detect_engine_family(&request.model_path);
        info!(
            model = %request.model_name,
            family = ?family,
            sampler = %request.sampler,
            "loading pipeline"
        );

        match family {
            EngineFamily::StableDiffusion(version) => Ok(Box::new(StableDiffusionLoader::load(
                version,
                request,
                &self.device,
            )?)),
            EngineFamily::Flux(variant) => {
                Ok(Box::new(FluxLoader::load(variant, request, &self.device)?))
            }
            EngineFamily::QwenImage => Err(EaselError::UnsupportedEngine(format!(
                "{} is a Qwen-Image model, which this build cannot run",
                request.model_name
            ))),
            EngineFamily::Unsupported(kind) => Err(EaselError::UnsupportedEngine(format!(
                "{} ({kind}) has no runtime support in this build",
                request.model_name
            ))),
        }
    }
}
