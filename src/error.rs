//! Error types shared by the library.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GenerateError>;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Checkpoint not found at path: {0}")]
    CheckpointNotFound(String),

    #[error("Invalid checkpoint tracker: {0}")]
    InvalidTracker(String),

    #[error(
        "Checkpoint argument mismatch for {name}: checkpoint has {checkpoint}, run has {current}"
    )]
    CheckpointMismatch {
        name: &'static str,
        checkpoint: usize,
        current: usize,
    },

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Weight shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Key/value cache full: {len} cached + {incoming} new exceeds capacity {capacity}")]
    CacheOverflow {
        len: usize,
        incoming: usize,
        capacity: usize,
    },

    #[error("Position {position} exceeds max position embeddings {max}")]
    PositionOverflow { position: usize, max: usize },

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
