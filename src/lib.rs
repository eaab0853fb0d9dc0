//! Latency benchmark for sparse and quantized convolutional inference.
//!
//! A baseline residual network is cloned, optionally 2:4 sparsified,
//! optionally quantized to int8 (prepare, calibrate, convert), traced into a
//! graph and compiled into an inference engine. Each engine and the baseline
//! itself are then timed with a synchronization barrier after every call.

pub mod benchmarks;
pub mod engine;
pub mod errors;
pub mod model;
pub mod ops;
pub mod quantization;
pub mod runtime;
pub mod sparsity;
pub mod tensor;
pub mod tracer;
pub mod utils;

pub use engine::{BuildFlags, BuilderSettings, Engine, EngineBuilder, EngineModule, InputTensorSpec};
pub use model::{ArchConfig, Network};
pub use quantization::{QuantMode, QuantizedNetwork};
pub use runtime::{DeviceContext, ExecutionContext, Forward, HostContext};
pub use tensor::Tensor;
