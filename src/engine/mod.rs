//! Inference engine compiler and runtime wrapper.
//!
//! [`EngineBuilder`] lowers a traced [`crate::tracer::Graph`] into an
//! [`Engine`]: ReLUs are fused into the preceding convolution, linear or
//! residual add, explicit quantize/dequantize pairs are folded into int8
//! kernels, and weights are packed in the requested precision, using the 2:4
//! compressed layout where the rows allow it. [`EngineModule`] is the
//! callable the benchmark times.

pub mod builder;
pub mod input_spec;
pub mod kernels;
pub mod module;
pub mod plan;

pub use builder::{BuildFlags, BuilderLogLevel, BuilderSettings, EngineBuilder, InterpreterResult};
pub use input_spec::{BatchRange, DType, InputTensorSpec, ShapeRange};
pub use kernels::{Compute, Layout, PackedWeights, Storage, WeightedKernel};
pub use module::EngineModule;
pub use plan::{ENGINE_PLAN_MAGIC, ENGINE_PLAN_VERSION, Engine, Step, StepKind};
