use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::{
    BuildRequest, EaselError, MemoryOptions, Pipeline, PipelineFactory, Result, TaskKind,
};

pub type SharedPipeline = Arc<Mutex<Box<dyn Pipeline>>>;

/// Identity of a cached pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub task: TaskKind,
    pub model: String,
    pub sampler: String,
}

struct Slot {
    key: CacheKey,
    pipeline: SharedPipeline,
}

/// Holds at most one loaded pipeline per [`TaskKind`].
///
/// The slot stays locked while a pipeline is being built, so concurrent
/// requests for the same slot wait for one construction instead of racing.
/// Asking for a different model or sampler evicts the current handle before
/// the replacement is built. Handles already given out stay alive until their
/// holders drop them; the orchestrator only asks for one while no other
/// generation is running.
pub struct PipelineCache {
    factory: Arc<dyn PipelineFactory>,
    memory: MemoryOptions,
    text_to_image: Mutex<Option<Slot>>,
    image_to_image: Mutex<Option<Slot>>,
}

impl PipelineCache {
    pub fn new(factory: Arc<dyn PipelineFactory>) -> Self {
        Self::with_memory_options(factory, MemoryOptions::default())
    }

    pub fn with_memory_options(factory: Arc<dyn PipelineFactory>, memory: MemoryOptions) -> Self {
        Self {
            factory,
            memory,
            text_to_image: Mutex::new(None),
            image_to_image: Mutex::new(None),
        }
    }

    fn slot(&self, task: TaskKind) -> MutexGuard<'_, Option<Slot>> {
        let slot = match task {
            TaskKind::TextToImage => &self.text_to_image,
            TaskKind::ImageToImage => &self.image_to_image,
        };
        // A panic while building leaves the slot empty or intact, never half
        // written, so a poisoned lock is safe to reuse.
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_build(
        &self,
        task: TaskKind,
        model_name: &str,
        model_path: &Path,
        sampler: &str,
    ) -> Result<SharedPipeline> {
        let key = CacheKey {
            task,
            model: model_name.to_string(),
            sampler: sampler.to_string(),
        };

        let mut slot = self.slot(task);
        if let Some(current) = slot.as_ref() {
            if current.key == key {
                return Ok(current.pipeline.clone());
            }
            info!(
                task = %task,
                evicted_model = %current.key.model,
                evicted_sampler = %current.key.sampler,
                model = %key.model,
                sampler = %key.sampler,
                "replacing cached pipeline"
            );
        }
        // Free the old weights before loading new ones.
        *slot = None;

        info!(task = %task, model = %model_name, sampler, "building pipeline");
        let request = BuildRequest {
            task,
            model_name: model_name.to_string(),
            model_path: model_path.to_path_buf(),
            sampler: sampler.to_string(),
            memory: self.memory,
        };
        let pipeline = self.factory.build(&request).map_err(|e| {
            warn!(task = %task, model = %model_name, error = %e, "pipeline construction failed");
            e
        })?;

        let pipeline: SharedPipeline = Arc::new(Mutex::new(pipeline));
        *slot = Some(Slot {
            key,
            pipeline: pipeline.clone(),
        });
        Ok(pipeline)
    }

    /// The key of the pipeline currently loaded for `task`.
    pub fn loaded(&self, task: TaskKind) -> Option<CacheKey> {
        self.slot(task).as_ref().map(|s| s.key.clone())
    }

    /// Drop the pipeline for `task`. Returns whether one was loaded.
    pub fn evict(&self, task: TaskKind) -> bool {
        self.slot(task).take().is_some()
    }
}

/// Lock a shared pipeline, mapping poisoning to an engine failure.
pub(crate) fn lock_pipeline(pipeline: &SharedPipeline) -> Result<MutexGuard<'_, Box<dyn Pipeline>>> {
    pipeline.lock().map_err(|_| {
        EaselError::EngineFailure(anyhow::anyhow!(
            "pipeline lock poisoned by an earlier panic during generation"
        ))
    })
}
