//! Intermediate graph representation consumed by the engine builder.

use crate::errors::{TraceError, TraceResult};
use crate::ops::ConvParams;

pub type NodeId = usize;

/// Weight payload of a weighted node.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightInit {
    Float(Vec<f32>),
    /// Per-channel symmetric int8 weights (explicitly quantized graphs).
    Int8 { values: Vec<i8>, scales: Vec<f32> },
}

impl WeightInit {
    pub fn len(&self) -> usize {
        match self {
            WeightInit::Float(values) => values.len(),
            WeightInit::Int8 { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Weights as f32, dequantizing int8 payloads.
    pub fn to_f32(&self, cols: usize) -> Vec<f32> {
        match self {
            WeightInit::Float(values) => values.clone(),
            WeightInit::Int8 { values, scales } => values
                .chunks(cols.max(1))
                .zip(scales)
                .flat_map(|(row, &scale)| row.iter().map(move |&q| q as f32 * scale))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Input,
    Conv2d {
        params: ConvParams,
        weight: WeightInit,
        bias: Vec<f32>,
        /// Activation range of the input, set on implicitly quantized graphs.
        dynamic_range: Option<f32>,
    },
    Linear {
        in_features: usize,
        out_features: usize,
        weight: WeightInit,
        bias: Vec<f32>,
        dynamic_range: Option<f32>,
    },
    Relu,
    MaxPool {
        kernel: usize,
        stride: usize,
    },
    Add,
    GlobalAvgPool,
    Quantize {
        scale: f32,
        qmax: i32,
    },
    Dequantize {
        scale: f32,
    },
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Input => "input",
            Op::Conv2d { .. } => "conv2d",
            Op::Linear { .. } => "linear",
            Op::Relu => "relu",
            Op::MaxPool { .. } => "max_pool2d",
            Op::Add => "add",
            Op::GlobalAvgPool => "global_avg_pool",
            Op::Quantize { .. } => "quantize_per_tensor",
            Op::Dequantize { .. } => "dequantize",
        }
    }

    pub fn is_weighted(&self) -> bool {
        matches!(self, Op::Conv2d { .. } | Op::Linear { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Op,
    pub inputs: Vec<NodeId>,
    /// Filled in by shape propagation.
    pub shape: Option<Vec<usize>>,
}

/// Nodes in topological order with a single input and a single output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    output: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, op: Op, inputs: Vec<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            op,
            inputs,
            shape: None,
        });
        id
    }

    pub fn set_output(&mut self, id: NodeId) {
        self.output = Some(id);
    }

    pub fn output(&self) -> TraceResult<NodeId> {
        self.output
            .filter(|&id| id < self.nodes.len())
            .ok_or(TraceError::EmptyGraph)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Ids of the nodes that consume `id`.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.inputs.contains(&id))
            .map(|node| node.id)
            .collect()
    }

    pub fn input_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|node| node.op == Op::Input)
    }

    /// Whether the graph carries explicit quantize/dequantize boundaries.
    pub fn has_qdq(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| matches!(node.op, Op::Quantize { .. } | Op::Dequantize { .. }))
    }

    pub fn count(&self, kind: &str) -> usize {
        self.nodes.iter().filter(|node| node.op.kind() == kind).count()
    }
}
