//! Error types for the benchmark library.
//!
//! Every stage of the build pipeline (model, sparsifier, quantizer, tracer,
//! engine compiler, runtime) owns a specific error type, avoiding generic
//! wrappers like `anyhow` or `Box<dyn Error>` so a failed run points at the
//! stage that aborted it.

mod compile_error;
mod model_error;
mod quantization_error;
mod runtime_error;
mod sparsity_error;
mod trace_error;

pub use compile_error::CompileError;
pub use model_error::ModelError;
pub use quantization_error::QuantizationError;
pub use runtime_error::RuntimeError;
pub use sparsity_error::SparsityError;
pub use trace_error::TraceError;

/// Result type alias for model construction and forward passes.
pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Result type alias for sparsifier operations.
pub type SparsityResult<T> = std::result::Result<T, SparsityError>;

/// Result type alias for quantization preparation, calibration and conversion.
pub type QuantizationResult<T> = std::result::Result<T, QuantizationError>;

/// Result type alias for graph tracing.
pub type TraceResult<T> = std::result::Result<T, TraceError>;

/// Result type alias for engine compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Result type alias for execution of callables on a context.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
