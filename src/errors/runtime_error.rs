use thiserror::Error;

use super::{ModelError, QuantizationError};

/// Errors raised while executing a callable on an execution context.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Input shape mismatch: expected {expected:?}, got {actual:?}")]
    InputShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Batch size {batch} outside engine range [{min}, {max}]")]
    BatchOutOfRange { batch: usize, min: usize, max: usize },

    #[error("Engine expects inputs {expected:?} but was bound to {actual:?}")]
    BindingMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Device stream is closed")]
    StreamClosed,

    #[error("Failed to start the '{context}' stream: {source}")]
    StreamSpawn {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine step '{step}' reads slot {slot} before it is written")]
    MissingValue { step: String, slot: usize },

    #[error("A job panicked on the '{context}' stream")]
    JobPanicked { context: String },

    #[error("Model execution failed: {0}")]
    Model(#[from] ModelError),

    #[error("Quantized model execution failed: {0}")]
    Quantization(#[from] QuantizationError),
}
