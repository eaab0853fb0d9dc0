//! Runtime wrapper around a compiled engine.

use super::builder::InterpreterResult;
use super::plan::Engine;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::runtime::Forward;
use crate::tensor::Tensor;

/// Callable form of an engine, bound to named inputs and outputs.
#[derive(Debug, Clone)]
pub struct EngineModule {
    engine: Engine,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl EngineModule {
    /// Binds the engine to the names reported by the builder.
    pub fn new(result: InterpreterResult) -> RuntimeResult<Self> {
        let InterpreterResult {
            engine,
            input_names,
            output_names,
        } = result;
        if input_names.as_slice() != [engine.input_name()] {
            return Err(RuntimeError::BindingMismatch {
                expected: vec![engine.input_name().to_string()],
                actual: input_names,
            });
        }
        if output_names.as_slice() != [engine.output_name()] {
            return Err(RuntimeError::BindingMismatch {
                expected: vec![engine.output_name().to_string()],
                actual: output_names,
            });
        }
        Ok(Self {
            engine,
            input_names,
            output_names,
        })
    }

    /// Wraps a deserialized engine with its own binding names.
    pub fn from_engine(engine: Engine) -> Self {
        Self {
            input_names: vec![engine.input_name().to_string()],
            output_names: vec![engine.output_name().to_string()],
            engine,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

impl Forward for EngineModule {
    fn forward(&self, input: &Tensor) -> RuntimeResult<Tensor> {
        self.engine.execute(input)
    }
}
