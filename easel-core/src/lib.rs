pub mod cache;
pub mod callback;
pub mod device;
mod error;
mod flux;
pub mod loader;
mod loader_factory;
pub mod orchestrator;
mod pipeline;
pub mod progress;
pub mod registry;
mod request;
mod stable_diffusion;
pub mod stream;
mod util;

pub use cache::{CacheKey, PipelineCache, SharedPipeline};
pub use callback::*;
pub use device::*;
pub use error::*;
pub use flux::{FluxLoader, FluxModel};
pub use loader::Loader;
pub(crate) use loader::{
    find_file, find_weights, initial_noise, load_tokenizer, mmap_weights, seed_device,
};
pub use loader_factory::*;
pub use orchestrator::{GeneratedArtifact, GenerationStage, Orchestrator, OrchestratorConfig};
pub use pipeline::*;
pub use progress::*;
pub use registry::*;
pub use request::*;
pub use stable_diffusion::{Sampler, StableDiffusionLoader, StableDiffusionModel};
pub use stream::{stream_generation, BridgeOptions, GenerationJob};
pub use util::*;
