use thiserror::Error;

/// Errors raised while tracing a model into the graph representation.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Traced graph has no output node")]
    EmptyGraph,

    #[error("Node '{node}' references unknown node id {id}")]
    UnknownNode { node: String, id: usize },

    #[error("Shape propagation failed at node '{node}': {message}")]
    ShapeMismatch { node: String, message: String },

    #[error("Sample input must be a 4-D NCHW tensor, got shape {shape:?}")]
    InvalidSample { shape: Vec<usize> },
}
