//! Shape propagation over a traced graph.

use super::graph::{Graph, Op};
use crate::errors::{ModelError, TraceError, TraceResult};
use crate::ops;

/// Annotates every node with its output shape for an input of `input_shape`.
///
/// Fails on the first node whose inputs are inconsistent with its op.
pub fn propagate(graph: &mut Graph, input_shape: &[usize]) -> TraceResult<()> {
    if input_shape.len() != 4 {
        return Err(TraceError::InvalidSample {
            shape: input_shape.to_vec(),
        });
    }

    let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(graph.nodes().len());
    for node in graph.nodes() {
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for &id in &node.inputs {
            let shape = shapes.get(id).ok_or_else(|| TraceError::UnknownNode {
                node: node.name.clone(),
                id,
            })?;
            inputs.push(shape.as_slice());
        }

        let mismatch = |message: String| TraceError::ShapeMismatch {
            node: node.name.clone(),
            message,
        };
        let from_model = |e: ModelError| TraceError::ShapeMismatch {
            node: node.name.clone(),
            message: e.to_string(),
        };
        let first = || {
            inputs
                .first()
                .map(|shape| shape.to_vec())
                .ok_or_else(|| mismatch("missing input".to_string()))
        };

        let shape = match &node.op {
            Op::Input => input_shape.to_vec(),
            Op::Conv2d { params, weight, .. } => {
                let expected = params.out_channels * params.in_channels * params.kernel * params.kernel;
                if weight.len() != expected {
                    return Err(mismatch(format!(
                        "weight holds {} values, expected {}",
                        weight.len(),
                        expected
                    )));
                }
                params.output_shape(&node.name, &first()?).map_err(from_model)?
            }
            Op::Linear {
                in_features,
                out_features,
                weight,
                ..
            } => {
                if weight.len() != in_features * out_features {
                    return Err(mismatch(format!(
                        "weight holds {} values, expected {}",
                        weight.len(),
                        in_features * out_features
                    )));
                }
                match first()?.as_slice() {
                    &[batch, features] if features == *in_features => vec![batch, *out_features],
                    other => {
                        return Err(mismatch(format!(
                            "expected [N, {}] input, got {:?}",
                            in_features, other
                        )));
                    }
                }
            }
            Op::Relu | Op::Quantize { .. } | Op::Dequantize { .. } => first()?,
            Op::MaxPool { kernel, stride } => {
                ops::max_pool_output_shape(&node.name, &first()?, *kernel, *stride)
                    .map_err(from_model)?
            }
            Op::Add => {
                if inputs.len() != 2 || inputs[0] != inputs[1] {
                    return Err(mismatch(format!("cannot add shapes {:?}", inputs)));
                }
                inputs[0].to_vec()
            }
            Op::GlobalAvgPool => match first()?.as_slice() {
                &[batch, channels, _, _] => vec![batch, channels],
                other => return Err(mismatch(format!("expected NCHW input, got {:?}", other))),
            },
        };
        shapes.push(shape);
    }

    graph.output()?;
    for (node, shape) in graph.nodes_mut().iter_mut().zip(shapes) {
        node.shape = Some(shape);
    }
    Ok(())
}
