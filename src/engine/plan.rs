//! Compiled engine: an ordered list of kernel steps over value slots, and its
//! binary plan format.

use std::fs;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use super::builder::BuildFlags;
use super::input_spec::BatchRange;
use super::kernels::WeightedKernel;
use crate::errors::{CompileError, CompileResult, RuntimeError, RuntimeResult};
use crate::ops::{self, ConvParams};
use crate::quantization::fake_quantize;
use crate::tensor::Tensor;

/// Magic number of the plan format ("SQPL" in little-endian).
pub const ENGINE_PLAN_MAGIC: u32 = 0x4C50_5153;

/// Plan format version.
pub const ENGINE_PLAN_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PlanHeader {
    magic: u32,
    version: u32,
    payload_len: u64,
}

const HEADER_LEN: usize = std::mem::size_of::<PlanHeader>();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Conv {
        params: ConvParams,
        kernel: WeightedKernel,
    },
    Linear {
        in_features: usize,
        out_features: usize,
        kernel: WeightedKernel,
    },
    Relu,
    MaxPool {
        kernel: usize,
        stride: usize,
    },
    Add {
        relu: bool,
    },
    GlobalAvgPool,
    /// Quantize followed by dequantize, kept when it could not be folded.
    FakeQuant {
        scale: f32,
        qmax: i32,
    },
}

impl StepKind {
    pub fn weighted_kernel(&self) -> Option<&WeightedKernel> {
        match self {
            StepKind::Conv { kernel, .. } | StepKind::Linear { kernel, .. } => Some(kernel),
            _ => None,
        }
    }

    /// Weight matrix shape implied by the step's own parameters.
    fn declared_weight_dims(&self) -> Option<(usize, usize, &WeightedKernel)> {
        match self {
            StepKind::Conv { params, kernel } => Some((
                params.out_channels,
                params.in_channels * params.kernel * params.kernel,
                kernel,
            )),
            StepKind::Linear {
                in_features,
                out_features,
                kernel,
            } => Some((*out_features, *in_features, kernel)),
            _ => None,
        }
    }
}

/// One kernel launch: reads `inputs` slots and writes `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub inputs: Vec<usize>,
    pub output: usize,
}

/// The executable engine produced by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub(crate) input_name: String,
    pub(crate) output_name: String,
    /// Input shape without the batch dimension.
    pub(crate) item_shape: Vec<usize>,
    pub(crate) batch_range: BatchRange,
    pub(crate) flags: BuildFlags,
    pub(crate) slots: usize,
    pub(crate) output_slot: usize,
    pub(crate) steps: Vec<Step>,
}

/// Slot the engine input is bound to.
pub(crate) const INPUT_SLOT: usize = 0;

impl Engine {
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn item_shape(&self) -> &[usize] {
        &self.item_shape
    }

    pub fn batch_range(&self) -> BatchRange {
        self.batch_range
    }

    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of weighted steps running on the 2:4 compressed layout.
    pub fn sparse_layers(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|step| step.kind.weighted_kernel())
            .filter(|kernel| kernel.weights.is_sparse())
            .count()
    }

    /// Runs the engine on an `[N, ...item_shape]` batch.
    pub fn execute(&self, input: &Tensor) -> RuntimeResult<Tensor> {
        let shape = input.shape();
        if shape.len() != self.item_shape.len() + 1 || shape[1..] != self.item_shape[..] {
            let mut expected = vec![self.batch_range.opt];
            expected.extend_from_slice(&self.item_shape);
            return Err(RuntimeError::InputShapeMismatch {
                expected,
                actual: shape.to_vec(),
            });
        }
        if !self.batch_range.contains(shape[0]) {
            return Err(RuntimeError::BatchOutOfRange {
                batch: shape[0],
                min: self.batch_range.min,
                max: self.batch_range.max,
            });
        }

        let mut values: Vec<Option<Tensor>> = vec![None; self.slots];
        values[INPUT_SLOT] = Some(input.clone());

        for step in &self.steps {
            let read = |index: usize| -> RuntimeResult<&Tensor> {
                step.inputs
                    .get(index)
                    .and_then(|&slot| values.get(slot))
                    .and_then(Option::as_ref)
                    .ok_or_else(|| RuntimeError::MissingValue {
                        step: step.name.clone(),
                        slot: step.inputs.get(index).copied().unwrap_or(usize::MAX),
                    })
            };
            let x = read(0)?;

            let output = match &step.kind {
                StepKind::Conv { params, kernel } => {
                    ops::conv2d_with(&step.name, x, params, |columns, _, out| kernel.apply(columns, out))?
                }
                StepKind::Linear {
                    in_features,
                    out_features,
                    kernel,
                } => ops::linear_with(&step.name, x, *in_features, *out_features, |row, _, out| {
                    kernel.apply(row, out)
                })?,
                StepKind::Relu => {
                    let mut y = x.clone();
                    ops::relu_inplace(&mut y);
                    y
                }
                StepKind::MaxPool { kernel, stride } => ops::max_pool2d(&step.name, x, *kernel, *stride)?,
                StepKind::Add { relu } => {
                    let mut y = x.clone();
                    ops::add_inplace(&mut y, read(1)?)?;
                    if *relu {
                        ops::relu_inplace(&mut y);
                    }
                    y
                }
                StepKind::GlobalAvgPool => ops::global_avg_pool(x)?,
                StepKind::FakeQuant { scale, qmax } => {
                    let mut y = x.clone();
                    for v in y.data_mut() {
                        *v = fake_quantize(*v, *scale, *qmax);
                    }
                    y
                }
            };
            values[step.output] = Some(output);
        }

        values[self.output_slot]
            .take()
            .ok_or_else(|| RuntimeError::MissingValue {
                step: self.output_name.clone(),
                slot: self.output_slot,
            })
    }

    /// Serializes the engine into a plan: a fixed header followed by the JSON
    /// encoded engine.
    pub fn serialize(&self) -> CompileResult<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let header = PlanHeader {
            magic: ENGINE_PLAN_MAGIC,
            version: ENGINE_PLAN_VERSION,
            payload_len: payload.len() as u64,
        };
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> CompileResult<Self> {
        let invalid = |message: String| CompileError::InvalidPlan { message };
        if bytes.len() < HEADER_LEN {
            return Err(invalid(format!("plan holds {} bytes, header needs {}", bytes.len(), HEADER_LEN)));
        }
        let header: PlanHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        if header.magic != ENGINE_PLAN_MAGIC {
            return Err(invalid(format!("bad magic {:#010x}", header.magic)));
        }
        if header.version != ENGINE_PLAN_VERSION {
            return Err(invalid(format!(
                "unsupported version {} (expected {})",
                header.version, ENGINE_PLAN_VERSION
            )));
        }
        let payload = &bytes[HEADER_LEN..];
        if payload.len() as u64 != header.payload_len {
            return Err(invalid(format!(
                "payload holds {} bytes, header declares {}",
                payload.len(),
                header.payload_len
            )));
        }

        let engine: Engine = serde_json::from_slice(payload)?;
        engine.validate()?;
        Ok(engine)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CompileResult<()> {
        fs::write(path, self.serialize()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> CompileResult<Self> {
        Self::deserialize(&fs::read(path)?)
    }

    /// Checks that every step reads slots written before it and that the
    /// weighted kernels are internally consistent.
    pub(crate) fn validate(&self) -> CompileResult<()> {
        let invalid = |message: String| CompileError::InvalidPlan { message };
        let mut written = vec![false; self.slots];
        match written.get_mut(INPUT_SLOT) {
            Some(slot) => *slot = true,
            None => return Err(invalid("engine has no slots".to_string())),
        }

        for step in &self.steps {
            let arity = match step.kind {
                StepKind::Add { .. } => 2,
                _ => 1,
            };
            if step.inputs.len() != arity {
                return Err(invalid(format!(
                    "step '{}' takes {} inputs, got {}",
                    step.name,
                    arity,
                    step.inputs.len()
                )));
            }
            if let Some(&slot) = step.inputs.iter().find(|&&slot| !written.get(slot).copied().unwrap_or(false)) {
                return Err(invalid(format!("step '{}' reads unwritten slot {}", step.name, slot)));
            }
            if let Some(kernel) = step.kind.weighted_kernel()
                && !kernel.is_consistent()
            {
                return Err(invalid(format!("step '{}' has inconsistent weights", step.name)));
            }
            if let Some((rows, cols, kernel)) = step.kind.declared_weight_dims()
                && (kernel.weights.rows, kernel.weights.cols) != (rows, cols)
            {
                return Err(invalid(format!(
                    "step '{}' declares {}x{} weights, kernel holds {}x{}",
                    step.name, rows, cols, kernel.weights.rows, kernel.weights.cols
                )));
            }
            match written.get_mut(step.output) {
                Some(slot) => *slot = true,
                None => return Err(invalid(format!("step '{}' writes slot {} out of range", step.name, step.output))),
            }
        }

        if !written.get(self.output_slot).copied().unwrap_or(false) {
            return Err(invalid(format!("output slot {} is never written", self.output_slot)));
        }
        Ok(())
    }
}
