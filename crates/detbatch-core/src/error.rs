use thiserror::Error;

/// Top-level error type for the detbatch pipeline.
#[derive(Debug, Error)]
pub enum DetError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Model loading error: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Result persistence error: {0}")]
    Persist(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Detector shard for worker {worker} is unavailable")]
    ShardUnavailable { worker: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DetError>;
