//! Engine builder: lowers a traced graph into an [`Engine`].

use log::{Level, log};
use serde::{Deserialize, Serialize};

use super::input_spec::InputTensorSpec;
use super::kernels::{Compute, PackedWeights, Storage, WeightedKernel};
use super::plan::{Engine, INPUT_SLOT, Step, StepKind};
use crate::errors::{CompileError, CompileResult};
use crate::quantization::{MIN_SCALE, per_channel_scales, quantize};
use crate::tracer::{Graph, Node, NodeId, Op, WeightInit};

/// Symmetric int8 range used by the engine for implicit quantization.
const INT8_QMAX: i32 = 127;

/// Precision and weight-format switches of a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFlags {
    pub fp16_mode: bool,
    pub int8_mode: bool,
    pub sparse_weight: bool,
    /// Reject float fallbacks for layers without int8 calibration.
    pub strict_type_constraints: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderLogLevel {
    Error,
    Warning,
    Info,
    Verbose,
}

impl BuilderLogLevel {
    fn level(self) -> Level {
        match self {
            BuilderLogLevel::Error => Level::Error,
            BuilderLogLevel::Warning => Level::Warn,
            BuilderLogLevel::Info => Level::Info,
            BuilderLogLevel::Verbose => Level::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    pub explicit_batch_dimension: bool,
    /// Required to build int8 kernels from quantize/dequantize nodes.
    pub explicit_precision: bool,
    /// Upper batch bound in implicit batch mode.
    pub max_batch_size: usize,
    pub log_level: BuilderLogLevel,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            explicit_batch_dimension: false,
            explicit_precision: false,
            max_batch_size: 64,
            log_level: BuilderLogLevel::Warning,
        }
    }
}

/// Output of a build, ready to be wrapped by [`super::EngineModule`].
#[derive(Debug, Clone)]
pub struct InterpreterResult {
    pub engine: Engine,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

pub struct EngineBuilder {
    graph: Graph,
    input_specs: Vec<InputTensorSpec>,
    settings: BuilderSettings,
}

/// Per-node bookkeeping while lowering.
#[derive(Debug, Clone, Copy, Default)]
struct Lowered {
    slot: usize,
    /// Step that produces the node's value, if it can absorb a following ReLU.
    fusable_step: Option<usize>,
    /// Int8 input boundary carried by a folded quantize/dequantize pair.
    folded_quant: Option<(f32, i32)>,
}

impl EngineBuilder {
    pub fn new(graph: Graph, input_specs: Vec<InputTensorSpec>, settings: BuilderSettings) -> Self {
        Self {
            graph,
            input_specs,
            settings,
        }
    }

    fn emit(&self, level: BuilderLogLevel, message: impl FnOnce() -> String) {
        if level <= self.settings.log_level {
            log!(level.level(), "{}", message());
        }
    }

    pub fn run(self, flags: BuildFlags) -> CompileResult<InterpreterResult> {
        self.emit(BuilderLogLevel::Info, || {
            format!(
                "Building engine: fp16_mode={}, int8_mode={}, sparse_weight={}, strict_type_constraints={}",
                flags.fp16_mode, flags.int8_mode, flags.sparse_weight, flags.strict_type_constraints
            )
        });

        let input = self.graph.input_node().ok_or_else(|| CompileError::UnsupportedNode {
            node: "<graph>".to_string(),
            message: "graph has no input node".to_string(),
        })?;
        let traced = shape_of(input)?.to_vec();

        let [spec] = self.input_specs.as_slice() else {
            return Err(CompileError::InputCountMismatch {
                expected: 1,
                actual: self.input_specs.len(),
            });
        };
        let batch_range = spec.resolve(
            &traced,
            self.settings.explicit_batch_dimension,
            self.settings.max_batch_size,
        )?;

        let has_qdq = self.graph.has_qdq();
        if has_qdq && flags.int8_mode && !self.settings.explicit_precision {
            return Err(CompileError::ExplicitPrecisionRequired);
        }

        let mut lowered = vec![Lowered::default(); self.graph.nodes().len()];
        let mut steps: Vec<Step> = Vec::new();
        let mut slots = INPUT_SLOT + 1;

        for node in self.graph.nodes() {
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for &id in &node.inputs {
                if id >= node.id {
                    return Err(CompileError::UnsupportedNode {
                        node: node.name.clone(),
                        message: format!("input {} is not defined before the node", id),
                    });
                }
                inputs.push(lowered[id]);
            }
            let first = || {
                inputs.first().copied().ok_or_else(|| CompileError::UnsupportedNode {
                    node: node.name.clone(),
                    message: "missing input".to_string(),
                })
            };
            let slots_of = |inputs: &[Lowered]| inputs.iter().map(|l| l.slot).collect::<Vec<_>>();

            let kind = match &node.op {
                Op::Input => {
                    lowered[node.id] = Lowered {
                        slot: INPUT_SLOT,
                        ..Lowered::default()
                    };
                    continue;
                }
                Op::Quantize { scale, qmax } => {
                    if flags.int8_mode && self.foldable(node.id) {
                        lowered[node.id] = Lowered {
                            slot: first()?.slot,
                            fusable_step: None,
                            folded_quant: Some((*scale, *qmax)),
                        };
                        continue;
                    }
                    StepKind::FakeQuant {
                        scale: *scale,
                        qmax: *qmax,
                    }
                }
                Op::Dequantize { .. } => {
                    // Fake-quant steps already produce dequantized values.
                    let source = first()?;
                    lowered[node.id] = Lowered {
                        fusable_step: None,
                        ..source
                    };
                    continue;
                }
                Op::Relu => {
                    let source = first()?;
                    if let Some(index) = source.fusable_step
                        && self.graph.users(node.inputs[0]).len() == 1
                        && fuse_relu(&mut steps[index].kind)
                    {
                        self.emit(BuilderLogLevel::Verbose, || {
                            format!("Fused '{}' into '{}'", node.name, steps[index].name)
                        });
                        lowered[node.id] = Lowered {
                            fusable_step: None,
                            ..source
                        };
                        continue;
                    }
                    StepKind::Relu
                }
                Op::MaxPool { kernel, stride } => StepKind::MaxPool {
                    kernel: *kernel,
                    stride: *stride,
                },
                Op::Add => StepKind::Add { relu: false },
                Op::GlobalAvgPool => StepKind::GlobalAvgPool,
                Op::Conv2d {
                    params,
                    weight,
                    bias,
                    dynamic_range,
                } => {
                    let cols = params.in_channels * params.kernel * params.kernel;
                    let kernel = self.compile_weighted(
                        node,
                        WeightSource {
                            weight,
                            bias,
                            rows: params.out_channels,
                            cols,
                            dynamic_range: *dynamic_range,
                            folded_quant: first()?.folded_quant,
                        },
                        flags,
                        has_qdq,
                    )?;
                    StepKind::Conv {
                        params: *params,
                        kernel,
                    }
                }
                Op::Linear {
                    in_features,
                    out_features,
                    weight,
                    bias,
                    dynamic_range,
                } => {
                    let kernel = self.compile_weighted(
                        node,
                        WeightSource {
                            weight,
                            bias,
                            rows: *out_features,
                            cols: *in_features,
                            dynamic_range: *dynamic_range,
                            folded_quant: first()?.folded_quant,
                        },
                        flags,
                        has_qdq,
                    )?;
                    StepKind::Linear {
                        in_features: *in_features,
                        out_features: *out_features,
                        kernel,
                    }
                }
            };

            let fusable = matches!(
                kind,
                StepKind::Conv { .. } | StepKind::Linear { .. } | StepKind::Add { .. }
            );
            steps.push(Step {
                name: node.name.clone(),
                kind,
                inputs: slots_of(&inputs),
                output: slots,
            });
            lowered[node.id] = Lowered {
                slot: slots,
                fusable_step: fusable.then_some(steps.len() - 1),
                folded_quant: None,
            };
            slots += 1;
        }

        let output_id = self.graph.output().map_err(|e| CompileError::UnsupportedNode {
            node: "<graph>".to_string(),
            message: e.to_string(),
        })?;
        let output_slot = lowered[output_id].slot;

        let engine = Engine {
            input_name: "input0".to_string(),
            output_name: "output0".to_string(),
            item_shape: traced[1..].to_vec(),
            batch_range,
            flags,
            slots,
            output_slot,
            steps,
        };
        engine.validate()?;

        let sparse = engine.sparse_layers();
        self.emit(BuilderLogLevel::Info, || {
            format!(
                "Built engine with {} steps ({} on sparse weights), batch range {}..={}",
                engine.steps().len(),
                sparse,
                batch_range.min,
                batch_range.max
            )
        });

        Ok(InterpreterResult {
            input_names: vec![engine.input_name.clone()],
            output_names: vec![engine.output_name.clone()],
            engine,
        })
    }

    /// A quantize node folds into int8 kernels when it only feeds dequantize
    /// nodes whose every user is a weighted op with int8 weights.
    fn foldable(&self, id: NodeId) -> bool {
        let users = self.graph.users(id);
        !users.is_empty()
            && users.iter().all(|&dq| {
                let Some(node) = self.graph.node(dq) else {
                    return false;
                };
                let consumers = self.graph.users(dq);
                matches!(node.op, Op::Dequantize { .. })
                    && !consumers.is_empty()
                    && consumers.iter().all(|&c| {
                        self.graph.node(c).is_some_and(|consumer| match &consumer.op {
                            Op::Conv2d { weight, .. } | Op::Linear { weight, .. } => {
                                matches!(weight, WeightInit::Int8 { .. })
                            }
                            _ => false,
                        })
                    })
            })
    }

    fn compile_weighted(
        &self,
        node: &Node,
        source: WeightSource<'_>,
        flags: BuildFlags,
        has_qdq: bool,
    ) -> CompileResult<WeightedKernel> {
        let WeightSource {
            weight,
            bias,
            rows,
            cols,
            dynamic_range,
            folded_quant,
        } = source;

        let (compute, storage) = match (folded_quant, weight, dynamic_range) {
            (Some((input_scale, input_qmax)), WeightInit::Int8 { values, scales }, _) => (
                Compute::Int8 {
                    input_scale,
                    input_qmax,
                    weight_scales: scales.clone(),
                },
                Storage::I8(values.clone()),
            ),
            (None, _, Some(range)) if flags.int8_mode && !has_qdq => {
                let float = weight.to_f32(cols);
                let weight_scales = per_channel_scales(&float, cols, INT8_QMAX);
                let values = float
                    .chunks(cols.max(1))
                    .zip(&weight_scales)
                    .flat_map(|(row, &scale)| row.iter().map(move |&w| quantize(w, scale, INT8_QMAX)))
                    .collect();
                (
                    Compute::Int8 {
                        input_scale: (range / INT8_QMAX as f32).max(MIN_SCALE),
                        input_qmax: INT8_QMAX,
                        weight_scales,
                    },
                    Storage::I8(values),
                )
            }
            _ => {
                if flags.int8_mode && !has_qdq && flags.strict_type_constraints {
                    return Err(CompileError::MissingDynamicRange {
                        node: node.name.clone(),
                    });
                }
                let float = weight.to_f32(cols);
                if flags.fp16_mode {
                    (
                        Compute::F16,
                        Storage::F16(float.iter().map(|&w| half::f16::from_f32(w)).collect()),
                    )
                } else {
                    (Compute::F32, Storage::F32(float))
                }
            }
        };

        let weights = PackedWeights::pack(rows, cols, storage, flags.sparse_weight);
        if flags.sparse_weight {
            if weights.is_sparse() {
                self.emit(BuilderLogLevel::Info, || {
                    format!("Layer '{}' is eligible for 2:4 sparse math", node.name)
                });
            } else {
                self.emit(BuilderLogLevel::Verbose, || {
                    format!("Layer '{}' keeps dense weights", node.name)
                });
            }
        }
        self.emit(BuilderLogLevel::Verbose, || {
            format!("Layer '{}' runs {} kernels", node.name, compute.label())
        });

        Ok(WeightedKernel {
            weights,
            bias: bias.to_vec(),
            compute,
            relu: false,
        })
    }
}

struct WeightSource<'a> {
    weight: &'a WeightInit,
    bias: &'a [f32],
    rows: usize,
    cols: usize,
    dynamic_range: Option<f32>,
    folded_quant: Option<(f32, i32)>,
}

fn shape_of(node: &Node) -> CompileResult<&[usize]> {
    node.shape.as_deref().ok_or_else(|| CompileError::MissingShape {
        node: node.name.clone(),
    })
}

/// Marks a step as ending in a ReLU. Returns false for steps that cannot.
fn fuse_relu(kind: &mut StepKind) -> bool {
    match kind {
        StepKind::Conv { kernel, .. } | StepKind::Linear { kernel, .. } => {
            kernel.relu = true;
            true
        }
        StepKind::Add { relu } => {
            *relu = true;
            true
        }
        _ => false,
    }
}
