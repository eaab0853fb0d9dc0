//! Callables and the contexts they run on.

pub mod context;

pub use context::{DeviceContext, ExecutionContext, HostContext, Job};

use crate::errors::RuntimeResult;
use crate::model::Network;
use crate::quantization::QuantizedNetwork;
use crate::tensor::Tensor;

/// Anything the benchmark can time: the baseline network, the quantized
/// reference model or a compiled engine.
pub trait Forward: Send + Sync {
    fn forward(&self, input: &Tensor) -> RuntimeResult<Tensor>;
}

impl Forward for Network {
    fn forward(&self, input: &Tensor) -> RuntimeResult<Tensor> {
        Ok(Network::forward(self, input)?)
    }
}

impl Forward for QuantizedNetwork {
    fn forward(&self, input: &Tensor) -> RuntimeResult<Tensor> {
        Ok(QuantizedNetwork::forward(self, input)?)
    }
}
