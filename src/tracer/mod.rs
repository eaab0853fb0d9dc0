//! Symbolic tracing of a model into a flat [`Graph`].
//!
//! The tracer walks the layer list of a network, emitting one node per
//! operator. Quantized models contribute their quantization parameters:
//! explicit ones get a quantize/dequantize pair in front of every quantized
//! layer and carry int8 weights, implicit ones stay float and annotate each
//! quantized layer with the dynamic range of its input.

pub mod graph;
pub mod shape_prop;

pub use graph::{Graph, Node, NodeId, Op, WeightInit};

use log::debug;

use crate::errors::TraceResult;
use crate::model::{Conv2d, Layer, Linear, Network};
use crate::quantization::{LayerQuant, QuantMode, QuantizedNetwork};
use crate::tensor::Tensor;

/// A model the tracer can lower into a graph.
pub trait Traceable {
    fn network(&self) -> &Network;

    /// Quantization parameters of the weighted layer `fqn`, if it is quantized.
    fn layer_quant(&self, _fqn: &str) -> Option<&LayerQuant> {
        None
    }

    fn quant_mode(&self) -> Option<QuantMode> {
        None
    }
}

impl Traceable for Network {
    fn network(&self) -> &Network {
        self
    }
}

impl Traceable for QuantizedNetwork {
    fn network(&self) -> &Network {
        QuantizedNetwork::network(self)
    }

    fn layer_quant(&self, fqn: &str) -> Option<&LayerQuant> {
        self.layer(fqn)
    }

    fn quant_mode(&self) -> Option<QuantMode> {
        Some(self.mode())
    }
}

/// Traces `model` and propagates the shape of `sample` through the graph.
pub fn trace(model: &dyn Traceable, sample: &Tensor) -> TraceResult<Graph> {
    let mut graph = Graph::new();
    let mut current = graph.add_node("x", Op::Input, Vec::new());

    for named in model.network().layers() {
        let name = named.name.as_str();
        current = match &named.layer {
            Layer::Conv(conv) => emit_conv(&mut graph, model, name, conv, current),
            Layer::Relu => graph.add_node(name, Op::Relu, vec![current]),
            Layer::MaxPool { kernel, stride } => graph.add_node(
                name,
                Op::MaxPool {
                    kernel: *kernel,
                    stride: *stride,
                },
                vec![current],
            ),
            Layer::Block(block) => {
                let shortcut = match &block.downsample {
                    Some(downsample) => emit_conv(
                        &mut graph,
                        model,
                        &format!("{}.downsample", name),
                        downsample,
                        current,
                    ),
                    None => current,
                };
                let hidden = emit_conv(&mut graph, model, &format!("{}.conv1", name), &block.conv1, current);
                let hidden = graph.add_node(&format!("{}.relu1", name), Op::Relu, vec![hidden]);
                let hidden = emit_conv(&mut graph, model, &format!("{}.conv2", name), &block.conv2, hidden);
                let sum = graph.add_node(&format!("{}.add", name), Op::Add, vec![hidden, shortcut]);
                graph.add_node(&format!("{}.relu2", name), Op::Relu, vec![sum])
            }
            Layer::GlobalAvgPool => graph.add_node(name, Op::GlobalAvgPool, vec![current]),
            Layer::Linear(linear) => emit_linear(&mut graph, model, name, linear, current),
        };
    }
    graph.set_output(current);

    shape_prop::propagate(&mut graph, sample.shape())?;
    debug!(
        "Traced {} nodes ({} quantize, {} conv2d)",
        graph.nodes().len(),
        graph.count("quantize_per_tensor"),
        graph.count("conv2d")
    );
    Ok(graph)
}

/// Resolves the input edge, weight payload and dynamic range of a weighted layer.
fn quantized_input(
    graph: &mut Graph,
    model: &dyn Traceable,
    fqn: &str,
    weight: &[f32],
    input: NodeId,
) -> (NodeId, WeightInit, Option<f32>) {
    match (model.quant_mode(), model.layer_quant(fqn)) {
        (Some(QuantMode::Explicit), Some(quant)) => {
            let q = graph.add_node(
                &format!("{}.input_quant", fqn),
                Op::Quantize {
                    scale: quant.input_scale,
                    qmax: quant.input_qmax,
                },
                vec![input],
            );
            let dq = graph.add_node(
                &format!("{}.input_dequant", fqn),
                Op::Dequantize {
                    scale: quant.input_scale,
                },
                vec![q],
            );
            let weight = WeightInit::Int8 {
                values: quant.qweight.clone(),
                scales: quant.weight_scales.clone(),
            };
            (dq, weight, None)
        }
        (Some(QuantMode::Implicit), Some(quant)) => (
            input,
            WeightInit::Float(weight.to_vec()),
            Some(quant.dynamic_range()),
        ),
        _ => (input, WeightInit::Float(weight.to_vec()), None),
    }
}

fn emit_conv(graph: &mut Graph, model: &dyn Traceable, fqn: &str, conv: &Conv2d, input: NodeId) -> NodeId {
    let (input, weight, dynamic_range) = quantized_input(graph, model, fqn, &conv.weight, input);
    graph.add_node(
        fqn,
        Op::Conv2d {
            params: conv.params(),
            weight,
            bias: conv.bias.clone(),
            dynamic_range,
        },
        vec![input],
    )
}

fn emit_linear(graph: &mut Graph, model: &dyn Traceable, fqn: &str, linear: &Linear, input: NodeId) -> NodeId {
    let (input, weight, dynamic_range) = quantized_input(graph, model, fqn, &linear.weight, input);
    graph.add_node(
        fqn,
        Op::Linear {
            in_features: linear.in_features,
            out_features: linear.out_features,
            weight,
            bias: linear.bias.clone(),
            dynamic_range,
        },
        vec![input],
    )
}
