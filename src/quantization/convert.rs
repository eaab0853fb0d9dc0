//! Conversion of a calibrated model into its quantized reference form.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use super::observer::{fake_quantize, quantize};
use super::prepare::PreparedModel;
use crate::errors::{ModelResult, QuantizationError, QuantizationResult};
use crate::model::Network;
use crate::tensor::Tensor;

/// How quantization boundaries are handed to the engine compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantMode {
    /// Quantize/dequantize nodes are part of the traced graph.
    Explicit,
    /// The graph stays float; each quantized op carries a dynamic range and the
    /// compiler picks the int8 boundaries.
    Implicit,
}

/// Quantization parameters of one weighted layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerQuant {
    pub input_scale: f32,
    pub input_qmax: i32,
    pub weight_scales: Vec<f32>,
    pub weight_qmax: i32,
    /// Per-channel int8 weights, same layout as the float weight.
    pub qweight: Vec<i8>,
}

impl LayerQuant {
    /// Activation clipping threshold, used as the dynamic range in implicit mode.
    pub fn dynamic_range(&self) -> f32 {
        self.input_scale * self.input_qmax as f32
    }
}

/// The quantized reference model.
///
/// Its float weights are replaced by their dequantized int8 values and its
/// forward pass fake-quantizes the input of every quantized layer, so it
/// reproduces what an int8 engine should compute.
#[derive(Debug, Clone)]
pub struct QuantizedNetwork {
    mode: QuantMode,
    network: Network,
    layers: BTreeMap<String, LayerQuant>,
    calibration_passes: usize,
}

/// Freezes observer statistics into scales and quantizes the weights.
///
/// Fails when no calibration pass ran.
pub fn convert(prepared: PreparedModel, mode: QuantMode) -> QuantizationResult<QuantizedNetwork> {
    let (mut network, qconfigs, observers, passes) = prepared.into_parts();
    if passes == 0 {
        return Err(QuantizationError::NotCalibrated { passes });
    }

    let mut layers = BTreeMap::new();
    for view in network.weighted_layers_mut() {
        let (Some(qconfig), Some(observer)) = (qconfigs.get(&view.name), observers.get(&view.name))
        else {
            continue;
        };
        if observer.batches() == 0 {
            return Err(QuantizationError::EmptyObserver {
                layer: view.name.clone(),
            });
        }

        let weight_qmax = qconfig.weight.qmax();
        let weight_scales = super::observer::weight_scales(view.weight, view.cols, &qconfig.weight);
        let mut qweight = Vec::with_capacity(view.weight.len());
        for (row, &scale) in view.weight.chunks_mut(view.cols).zip(&weight_scales) {
            for w in row {
                let q = quantize(*w, scale, weight_qmax);
                qweight.push(q);
                *w = q as f32 * scale;
            }
        }

        let layer = LayerQuant {
            input_scale: observer.scale(),
            input_qmax: qconfig.activation.qmax(),
            weight_scales,
            weight_qmax,
            qweight,
        };
        debug!(
            "Quantized '{}': input scale {:.6}, {} channels",
            view.name,
            layer.input_scale,
            layer.weight_scales.len()
        );
        layers.insert(view.name, layer);
    }

    Ok(QuantizedNetwork {
        mode,
        network,
        layers,
        calibration_passes: passes,
    })
}

impl QuantizedNetwork {
    pub fn mode(&self) -> QuantMode {
        self.mode
    }

    /// Network holding the dequantized weights.
    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn layer(&self, fqn: &str) -> Option<&LayerQuant> {
        self.layers.get(fqn)
    }

    pub fn layers(&self) -> &BTreeMap<String, LayerQuant> {
        &self.layers
    }

    /// Calibration passes that ran before conversion.
    pub fn calibration_passes(&self) -> usize {
        self.calibration_passes
    }

    /// Fake-quantized forward pass.
    pub fn forward(&self, input: &Tensor) -> ModelResult<Tensor> {
        let layers = &self.layers;
        self.network.forward_with_hook(input, &mut |name, tensor| {
            if let Some(layer) = layers.get(name) {
                for v in tensor.data_mut() {
                    *v = fake_quantize(*v, layer.input_scale, layer.input_qmax);
                }
            }
        })
    }
}

/// One line for the model, then one per quantized layer.
impl fmt::Display for QuantizedNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} int8, {} layers, {} calibration passes",
            self.mode,
            self.layers.len(),
            self.calibration_passes
        )?;
        for (name, layer) in &self.layers {
            write!(
                f,
                "\n  {}: input scale {:.6} (qmax {}), {} weight channels",
                name,
                layer.input_scale,
                layer.input_qmax,
                layer.weight_scales.len()
            )?;
        }
        Ok(())
    }
}
