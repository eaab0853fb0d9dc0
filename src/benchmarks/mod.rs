//! Benchmark suite for sparse and quantized inference engines.
//!
//! Builds every configured engine variant from a private copy of the baseline
//! network, then times each engine and the baseline itself with a
//! synchronization barrier after every call.

pub mod benchmark_errors;
pub mod benchmark_runner;
pub mod benchmark_types;
pub mod performance_metrics;

pub use benchmark_errors::{BenchmarkError, BenchmarkResult, WithLabel};
pub use benchmark_runner::{
    BASELINE_DEVICE_LABEL, BASELINE_HOST_LABEL, BenchmarkRunner, BuiltVariant, ConfigLoader,
    DEFAULT_CONFIG_PATH,
};
pub use benchmark_types::{
    BenchConfig, Precision, TimingSample, Tolerance, VariantConfig, VariantConfigBuilder,
};
pub use performance_metrics::{print_performance_analysis, time_callable};
