use thiserror::Error;

/// Errors raised by the engine builder or while (de)serializing an engine plan.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Expected {expected} input specs, got {actual}")]
    InputCountMismatch { expected: usize, actual: usize },

    #[error("Input spec shape {spec:?} is incompatible with traced input shape {traced:?}")]
    InputSpecMismatch { spec: Vec<i64>, traced: Vec<usize> },

    #[error("Invalid shape range: {message}")]
    InvalidShapeRange { message: String },

    #[error("Explicit batch dimension required for dynamic input spec {spec:?}")]
    DynamicBatchRequiresExplicitBatch { spec: Vec<i64> },

    #[error("Graph contains quantize/dequantize nodes but explicit precision is disabled")]
    ExplicitPrecisionRequired,

    #[error("Node '{node}' has no dynamic range and strict type constraints are set")]
    MissingDynamicRange { node: String },

    #[error("Node '{node}' has no shape information, run shape propagation first")]
    MissingShape { node: String },

    #[error("Unsupported graph construct at node '{node}': {message}")]
    UnsupportedNode { node: String, message: String },

    #[error("Invalid engine plan: {message}")]
    InvalidPlan { message: String },

    #[error("Engine plan serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
