//! Observer insertion and calibration.

use std::collections::BTreeMap;

use log::debug;

use super::observer::Observer;
use super::qconfig::{QConfig, QConfigMap};
use crate::errors::{QuantizationError, QuantizationResult};
use crate::model::Network;
use crate::tensor::Tensor;

/// Number of calibration passes run before conversion.
pub const CALIBRATION_PASSES: usize = 10;

/// A network with an activation observer in front of every quantized layer.
#[derive(Debug, Clone)]
pub struct PreparedModel {
    network: Network,
    qconfigs: BTreeMap<String, QConfig>,
    observers: BTreeMap<String, Observer>,
    passes: usize,
}

/// Inserts observers for every weighted layer that `qconfig_map` quantizes.
pub fn prepare(network: Network, qconfig_map: &QConfigMap) -> QuantizationResult<PreparedModel> {
    let mut qconfigs = BTreeMap::new();
    let mut observers = BTreeMap::new();
    for view in network.weighted_layers() {
        if let Some(qconfig) = qconfig_map.qconfig_for(&view.name) {
            qconfig.validate()?;
            observers.insert(view.name.clone(), Observer::new(qconfig.activation));
            qconfigs.insert(view.name, *qconfig);
        }
    }
    if observers.is_empty() {
        return Err(QuantizationError::NoQuantizableLayers);
    }
    debug!("Inserted {} activation observers", observers.len());

    Ok(PreparedModel {
        network,
        qconfigs,
        observers,
        passes: 0,
    })
}

impl PreparedModel {
    /// Runs one calibration pass: a float forward that feeds every observer.
    pub fn forward(&mut self, input: &Tensor) -> QuantizationResult<Tensor> {
        let observers = &mut self.observers;
        let output = self.network.forward_with_hook(input, &mut |name, tensor| {
            if let Some(observer) = observers.get_mut(name) {
                observer.observe(tensor.data());
            }
        })?;
        self.passes += 1;
        Ok(output)
    }

    pub fn calibration_passes(&self) -> usize {
        self.passes
    }

    pub fn observer(&self, fqn: &str) -> Option<&Observer> {
        self.observers.get(fqn)
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Network,
        BTreeMap<String, QConfig>,
        BTreeMap<String, Observer>,
        usize,
    ) {
        (self.network, self.qconfigs, self.observers, self.passes)
    }
}

/// Runs exactly `passes` calibration passes over `data`.
pub fn calibrate(prepared: &mut PreparedModel, data: &Tensor, passes: usize) -> QuantizationResult<()> {
    for _ in 0..passes {
        prepared.forward(data)?;
    }
    Ok(())
}
