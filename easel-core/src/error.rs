use thiserror::Error;

/// Errors surfaced by the generation core.
#[derive(Error, Debug)]
pub enum EaselError {
    /// A model directory, manifest or weight file is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request carried data the core cannot work with (e.g. a corrupt
    /// base64 image or an empty prompt).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The model family has no runtime support in this build.
    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// The inference engine itself failed.
    #[error("inference engine failed: {0:#}")]
    EngineFailure(anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, EaselError>;

impl From<anyhow::Error> for EaselError {
    fn from(e: anyhow::Error) -> Self {
        // Keep the original kind when an engine bubbled one of ours up.
        match e.downcast::<EaselError>() {
            Ok(inner) => inner,
            Err(e) => EaselError::EngineFailure(e),
        }
    }
}

impl From<candle_core::Error> for EaselError {
    fn from(e: candle_core::Error) -> Self {
        EaselError::EngineFailure(e.into())
    }
}
