use thiserror::Error;

/// Errors raised while building, loading or running the baseline network.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Tensor shape {shape:?} does not hold {data_len} elements")]
    InvalidTensorShape { shape: Vec<usize>, data_len: usize },

    #[error("Input shape mismatch: expected {expected:?}, got {actual:?}")]
    InputShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Layer '{layer}' expects {expected} input channels but received {actual}")]
    ChannelMismatch {
        layer: String,
        expected: usize,
        actual: usize,
    },

    #[error("Layer '{layer}' produced an empty spatial output for input {height}x{width}")]
    EmptyOutput {
        layer: String,
        height: usize,
        width: usize,
    },

    #[error("Invalid architecture: {message}")]
    InvalidArchitecture { message: String },

    #[error("Unknown module '{name}'")]
    UnknownModule { name: String },

    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
