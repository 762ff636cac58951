//! Model discovery: scans the models directory, reads `model_index.json`
//! manifests and classifies what each model can be used for.
//!
//! Nothing here is cached; every call re-reads the filesystem so models can
//! be dropped into the directory while the server is running.

mod defaults;

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use defaults::*;

use crate::{EaselError, Result, TaskKind};

pub const MANIFEST_FILE: &str = "model_index.json";
const README_FILE: &str = "README.md";

/// What a model directory is good for.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelCapability {
    #[serde(rename = "Text-to-Image")]
    TextToImage,
    #[serde(rename = "Image-to-Image (Img2Img)")]
    ImageToImage,
    #[serde(rename = "Inpainting")]
    Inpainting,
    #[serde(rename = "Depth-to-Image")]
    DepthToImage,
    #[serde(rename = "Qwen-Image (Text-to-Image)")]
    QwenImage,
    #[serde(rename = "FLUX.1 (Text-to-Image)")]
    FluxText,
    #[serde(rename = "FLUX.1 (Image-to-Image)")]
    FluxKontext,
    #[serde(rename = "ControlNet (auxiliary)")]
    ControlNet,
    /// Nothing matched; most diffusion checkpoints are text-to-image.
    #[serde(rename = "Text-to-Image (most likely)")]
    TextToImageLikely,
}

impl ModelCapability {
    pub fn label(&self) -> &'static str {
        match self {
            ModelCapability::TextToImage => "Text-to-Image",
            ModelCapability::ImageToImage => "Image-to-Image (Img2Img)",
            ModelCapability::Inpainting => "Inpainting",
            ModelCapability::DepthToImage => "Depth-to-Image",
            ModelCapability::QwenImage => "Qwen-Image (Text-to-Image)",
            ModelCapability::FluxText => "FLUX.1 (Text-to-Image)",
            ModelCapability::FluxKontext => "FLUX.1 (Image-to-Image)",
            ModelCapability::ControlNet => "ControlNet (auxiliary)",
            ModelCapability::TextToImageLikely => "Text-to-Image (most likely)",
        }
    }

    pub fn is_text_to_image(&self) -> bool {
        matches!(
            self,
            ModelCapability::TextToImage
                | ModelCapability::QwenImage
                | ModelCapability::FluxText
                | ModelCapability::TextToImageLikely
        )
    }

    /// Most text-to-image checkpoints can also run image-conditioned, so they
    /// count as image-to-image capable too.
    pub fn is_image_to_image(&self) -> bool {
        matches!(
            self,
            ModelCapability::ImageToImage
                | ModelCapability::Inpainting
                | ModelCapability::DepthToImage
                | ModelCapability::FluxKontext
                | ModelCapability::TextToImage
                | ModelCapability::FluxText
                | ModelCapability::TextToImageLikely
        )
    }

    pub fn suits(&self, task: TaskKind) -> bool {
        match task {
            TaskKind::TextToImage => self.is_text_to_image(),
            TaskKind::ImageToImage => self.is_image_to_image(),
        }
    }
}

/// The parts of `model_index.json` the registry cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub class_name: Option<String>,
    pub pipeline_type: Option<String>,
    pub raw: serde_json::Value,
}

impl Manifest {
    pub fn read(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path)?;
        let raw: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            EaselError::InvalidInput(format!("malformed {}: {e}", path.display()))
        })?;
        let field = |key: &str| raw.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Ok(Self {
            class_name: field("_class_name"),
            pipeline_type: field("_pipeline_type"),
            raw,
        })
    }

    fn capability(&self) -> Option<ModelCapability> {
        let class = self.class_name.as_deref().unwrap_or_default().to_lowercase();
        let pipeline_type = self
            .pipeline_type
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();

        if class.contains("img2img") || pipeline_type.contains("image_to_image") {
            return Some(ModelCapability::ImageToImage);
        }
        if class.contains("inpaint") {
            return Some(ModelCapability::Inpainting);
        }
        if class.contains("depth") {
            return Some(ModelCapability::DepthToImage);
        }
        if class.contains("qwenimagepipeline") {
            return Some(ModelCapability::QwenImage);
        }
        if class.contains("fluxpipeline") {
            return Some(ModelCapability::FluxText);
        }
        if class.contains("fluxkontextpipeline") {
            return Some(ModelCapability::FluxKontext);
        }
        if ["stablediffusion", "pixart", "sd3"]
            .iter()
            .any(|k| class.contains(k))
        {
            return Some(ModelCapability::TextToImage);
        }
        None
    }
}

fn capability_from_folder_name(name: &str) -> Option<ModelCapability> {
    let name = name.to_lowercase();
    if ["inpainting", "inpaint", "-ip-"].iter().any(|k| name.contains(k)) {
        Some(ModelCapability::Inpainting)
    } else if name.contains("img2img") || name.contains("i2i") {
        Some(ModelCapability::ImageToImage)
    } else if name.contains("controlnet") {
        Some(ModelCapability::ControlNet)
    } else if name.contains("qwen") {
        Some(ModelCapability::QwenImage)
    } else if name.contains("flux") {
        Some(ModelCapability::FluxText)
    } else {
        None
    }
}

/// Classify the model at `model_dir`. The manifest wins when it is readable
/// and recognized; otherwise the folder name is used.
pub fn detect_model_type(model_dir: &Path) -> ModelCapability {
    if model_dir.join(MANIFEST_FILE).exists() {
        match Manifest::read(model_dir) {
            Ok(manifest) => {
                if let Some(capability) = manifest.capability() {
                    return capability;
                }
            }
            Err(e) => warn!(
                model = %model_dir.display(),
                error = %e,
                "could not read model manifest, falling back to folder name"
            ),
        }
    }

    model_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(capability_from_folder_name)
        .unwrap_or(ModelCapability::TextToImageLikely)
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub capability: ModelCapability,
    pub pipeline_class: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub defaults: Option<GenerationDefaults>,
}

/// How much of `README.md` goes into a descriptor.
#[derive(Debug, Clone, Copy)]
enum DescriptionLength {
    Summary,
    Detail,
}

/// The models root directory.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of model `name`. Names must stay inside the models root:
    /// empty, absolute, `.` and `..` components are rejected.
    pub fn model_path(&self, name: &str) -> Result<PathBuf> {
        let inside_root = !name.is_empty()
            && Path::new(name)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !inside_root {
            return Err(EaselError::InvalidInput(format!(
                "model name '{name}' must be a relative path inside the models directory"
            )));
        }
        Ok(self.root.join(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.model_path(name).is_ok_and(|path| path.is_dir())
    }

    /// Visible model directories, sorted by name.
    fn model_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == "__pycache__" {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                dirs.push((name, path));
            }
        }
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(dirs)
    }

    /// First model (by name) able to serve `task`, if any.
    pub fn recommend_model_for_task(&self, task: TaskKind) -> Option<String> {
        if !self.root.is_dir() {
            return None;
        }
        let dirs = match self.model_dirs() {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "could not scan models directory");
                return None;
            }
        };
        dirs.into_iter()
            .find(|(_, path)| detect_model_type(path).suits(task))
            .map(|(name, _)| name)
    }

    /// Every model directory that carries a manifest.
    pub fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        if !self.root.is_dir() {
            return Err(EaselError::NotFound(format!(
                "models directory {} not found",
                self.root.display()
            )));
        }
        let models: Vec<_> = self
            .model_dirs()?
            .into_iter()
            .filter(|(_, path)| path.join(MANIFEST_FILE).exists())
            .map(|(name, path)| describe_dir(name, path, DescriptionLength::Summary))
            .collect();
        debug!(count = models.len(), "listed models");
        Ok(models)
    }

    /// Details for one model; the manifest is optional here.
    pub fn describe(&self, name: &str) -> Result<ModelDescriptor> {
        if !self.contains(name) {
            return Err(EaselError::NotFound(format!("model '{name}' not found")));
        }
        Ok(describe_dir(
            name.to_string(),
            self.model_path(name)?,
            DescriptionLength::Detail,
        ))
    }
}

fn describe_dir(name: String, path: PathBuf, length: DescriptionLength) -> ModelDescriptor {
    let capability = detect_model_type(&path);
    let defaults = has_model_defaults(&name).then(|| model_defaults(&name));

    let (pipeline_class, config) = if path.join(MANIFEST_FILE).exists() {
        match Manifest::read(&path) {
            Ok(manifest) => (
                Some(manifest.class_name.unwrap_or_else(|| "Unknown".to_string())),
                Some(manifest.raw),
            ),
            Err(e) => {
                warn!(model = %name, error = %e, "could not read model config");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let description = read_description(&path, length).unwrap_or_else(|e| {
        warn!(model = %name, error = %e, "could not read model README");
        None
    });

    ModelDescriptor {
        name,
        path,
        capability,
        pipeline_class,
        description,
        config,
        defaults,
    }
}

fn read_description(model_dir: &Path, length: DescriptionLength) -> Result<Option<String>> {
    let readme = model_dir.join(README_FILE);
    if !readme.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(readme)?;
    let (text, limit) = match length {
        DescriptionLength::Summary => (text.lines().take(5).collect::<Vec<_>>().join("\n"), 200),
        DescriptionLength::Detail => (text, 500),
    };
    Ok(Some(truncate(text.trim(), limit)))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        format!("{}...", text.chars().take(limit).collect::<String>())
    } else {
        text.to_string()
    }
}
