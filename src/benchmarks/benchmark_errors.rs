//! Error types for benchmark operations.

use std::error::Error;
use std::fmt;

use crate::errors::{CompileError, ModelError, QuantizationError, RuntimeError, SparsityError, TraceError};

#[derive(Debug)]
pub enum BenchmarkError {
    ConfigParseError {
        path: String,
        source: serde_json::Error,
    },
    ConfigValidationError {
        field: String,
        message: String,
    },
    IoError {
        source: std::io::Error,
    },
    InvalidIterations {
        value: usize,
    },
    UnknownVariant {
        label: String,
    },
    InvalidVariant {
        message: String,
    },
    Model {
        source: ModelError,
    },
    Sparsity {
        variant: String,
        source: SparsityError,
    },
    Quantization {
        variant: String,
        source: QuantizationError,
    },
    Trace {
        variant: String,
        source: TraceError,
    },
    Compile {
        variant: String,
        source: CompileError,
    },
    Runtime {
        label: String,
        source: RuntimeError,
    },
    OutputMismatch {
        label: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl fmt::Display for BenchmarkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchmarkError::ConfigParseError { path, source } => {
                write!(f, "Failed to parse configuration file '{}': {}", path, source)
            }
            BenchmarkError::ConfigValidationError { field, message } => {
                write!(f, "Configuration validation error for field '{}': {}", field, message)
            }
            BenchmarkError::IoError { source } => {
                write!(f, "IO error: {}", source)
            }
            BenchmarkError::InvalidIterations { value } => {
                write!(f, "Invalid number of iterations: {}. Must be greater than 0", value)
            }
            BenchmarkError::UnknownVariant { label } => {
                write!(f, "Unknown variant '{}'. Use --list to see the available variants", label)
            }
            BenchmarkError::InvalidVariant { message } => {
                write!(f, "Invalid variant: {}", message)
            }
            BenchmarkError::Model { source } => {
                write!(f, "Baseline model error: {}", source)
            }
            BenchmarkError::Sparsity { variant, source } => {
                write!(f, "'{}' failed while sparsifying: {}", variant, source)
            }
            BenchmarkError::Quantization { variant, source } => {
                write!(f, "'{}' failed while quantizing: {}", variant, source)
            }
            BenchmarkError::Trace { variant, source } => {
                write!(f, "'{}' failed while tracing: {}", variant, source)
            }
            BenchmarkError::Compile { variant, source } => {
                write!(f, "'{}' failed while building the engine: {}", variant, source)
            }
            BenchmarkError::Runtime { label, source } => {
                write!(f, "'{}' failed while running: {}", label, source)
            }
            BenchmarkError::OutputMismatch {
                label,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "'{}' produced output shape {:?}, reference has {:?}",
                    label, actual, expected
                )
            }
        }
    }
}

impl Error for BenchmarkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BenchmarkError::ConfigParseError { source, .. } => Some(source),
            BenchmarkError::IoError { source } => Some(source),
            BenchmarkError::Model { source } => Some(source),
            BenchmarkError::Sparsity { source, .. } => Some(source),
            BenchmarkError::Quantization { source, .. } => Some(source),
            BenchmarkError::Trace { source, .. } => Some(source),
            BenchmarkError::Compile { source, .. } => Some(source),
            BenchmarkError::Runtime { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BenchmarkError {
    fn from(error: std::io::Error) -> Self {
        BenchmarkError::IoError { source: error }
    }
}

impl From<ModelError> for BenchmarkError {
    fn from(error: ModelError) -> Self {
        BenchmarkError::Model { source: error }
    }
}

/// Attaches the label of the variant or callable that failed.
pub trait WithLabel<T> {
    fn with_label(self, label: &str) -> BenchmarkResult<T>;
}

macro_rules! impl_with_label {
    ($error:ty, $variant:ident, $field:ident) => {
        impl<T> WithLabel<T> for Result<T, $error> {
            fn with_label(self, label: &str) -> BenchmarkResult<T> {
                self.map_err(|source| BenchmarkError::$variant {
                    $field: label.to_string(),
                    source,
                })
            }
        }
    };
}

impl_with_label!(SparsityError, Sparsity, variant);
impl_with_label!(QuantizationError, Quantization, variant);
impl_with_label!(TraceError, Trace, variant);
impl_with_label!(CompileError, Compile, variant);
impl_with_label!(RuntimeError, Runtime, label);

pub type BenchmarkResult<T> = Result<T, BenchmarkError>;
