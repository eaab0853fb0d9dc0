//! Packed weights and the matrix kernels the engine runs for weighted layers.
//!
//! Every weighted layer reduces to `out[row][patch] = w[row] . x[patch] + b`.
//! Weights are stored in the compute precision chosen by the builder (f32,
//! f16 or per-channel int8) and, when the rows follow the 2:4 pattern, in a
//! compressed layout that keeps two values and their in-group offsets per
//! group of four columns.

use std::borrow::Cow;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::quantization::quantize;
use crate::utils::{DotKernel, dot, dot_i8};

/// Columns per sparsity group and values kept per group.
const GROUP: usize = 4;
const KEPT: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I8(Vec<i8>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::F32(values) => values.len(),
            Storage::F16(values) => values.len(),
            Storage::I8(values) => values.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layout {
    Dense,
    /// `KEPT` entries per group; `offsets[i]` is the column of value `i`
    /// inside its group.
    Sparse24 { offsets: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedWeights {
    pub rows: usize,
    pub cols: usize,
    pub storage: Storage,
    pub layout: Layout,
}

fn groups(cols: usize) -> usize {
    cols.div_ceil(GROUP)
}

/// Compresses rows whose groups of four hold at most two non-zero values.
///
/// Returns `None` when some group is denser than that.
fn compress<T: Copy + Default + PartialEq>(values: &[T], cols: usize) -> Option<(Vec<T>, Vec<u8>)> {
    let zero = T::default();
    let mut kept = Vec::with_capacity(values.len() / 2 + GROUP);
    let mut offsets = Vec::with_capacity(kept.capacity());
    for row in values.chunks(cols) {
        for group in row.chunks(GROUP) {
            let mut slots = 0;
            for (offset, &value) in group.iter().enumerate() {
                if value != zero {
                    if slots == KEPT {
                        return None;
                    }
                    kept.push(value);
                    offsets.push(offset as u8);
                    slots += 1;
                }
            }
            for _ in slots..KEPT {
                kept.push(zero);
                offsets.push(0);
            }
        }
    }
    Some((kept, offsets))
}

impl PackedWeights {
    pub fn dense(rows: usize, cols: usize, storage: Storage) -> Self {
        Self {
            rows,
            cols,
            storage,
            layout: Layout::Dense,
        }
    }

    /// Packs `storage` in the 2:4 compressed layout if every group allows it,
    /// otherwise keeps it dense.
    pub fn pack(rows: usize, cols: usize, storage: Storage, sparse: bool) -> Self {
        if !sparse || cols == 0 {
            return Self::dense(rows, cols, storage);
        }
        let compressed = match &storage {
            Storage::F32(values) => compress(values, cols).map(|(v, o)| (Storage::F32(v), o)),
            Storage::F16(values) => compress(values, cols).map(|(v, o)| (Storage::F16(v), o)),
            Storage::I8(values) => compress(values, cols).map(|(v, o)| (Storage::I8(v), o)),
        };
        match compressed {
            Some((storage, offsets)) => Self {
                rows,
                cols,
                storage,
                layout: Layout::Sparse24 { offsets },
            },
            None => Self::dense(rows, cols, storage),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.layout, Layout::Sparse24 { .. })
    }

    /// Values stored per row.
    fn row_len(&self) -> usize {
        match self.layout {
            Layout::Dense => self.cols,
            Layout::Sparse24 { .. } => groups(self.cols) * KEPT,
        }
    }

    pub(crate) fn is_consistent(&self) -> bool {
        let offsets_ok = match &self.layout {
            Layout::Dense => true,
            Layout::Sparse24 { offsets } => {
                offsets.len() == self.storage.len() && offsets.iter().all(|&o| (o as usize) < GROUP)
            }
        };
        offsets_ok && self.storage.len() == self.rows * self.row_len()
    }

    fn float_values(&self) -> Option<Cow<'_, [f32]>> {
        match &self.storage {
            Storage::F32(values) => Some(Cow::Borrowed(values.as_slice())),
            Storage::F16(values) => Some(Cow::Owned(values.iter().map(|v| v.to_f32()).collect())),
            Storage::I8(_) => None,
        }
    }
}

/// Numeric precision of a weighted kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Compute {
    F32,
    /// Inputs and outputs are rounded through f16.
    F16,
    Int8 {
        input_scale: f32,
        input_qmax: i32,
        weight_scales: Vec<f32>,
    },
}

impl Compute {
    pub fn label(&self) -> &'static str {
        match self {
            Compute::F32 => "f32",
            Compute::F16 => "f16",
            Compute::Int8 { .. } => "int8",
        }
    }
}

/// A compiled convolution or linear layer, with an optionally fused ReLU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedKernel {
    pub weights: PackedWeights,
    pub bias: Vec<f32>,
    pub compute: Compute,
    pub relu: bool,
}

fn round_f16(value: f32) -> f32 {
    f16::from_f32(value).to_f32()
}

fn sparse_dot<T, X, A>(values: &[T], offsets: &[u8], patch: &[X], mul: impl Fn(T, X) -> A) -> A
where
    T: Copy,
    X: Copy,
    A: std::ops::Add<Output = A> + Default,
{
    let mut acc = A::default();
    for (group, (pair, offs)) in values.chunks_exact(KEPT).zip(offsets.chunks_exact(KEPT)).enumerate() {
        let base = group * GROUP;
        for (&value, &offset) in pair.iter().zip(offs) {
            acc = acc + mul(value, patch[base + offset as usize]);
        }
    }
    acc
}

impl WeightedKernel {
    /// Computes `out` (`rows x patches`) from `columns` (`patches x cols`).
    pub fn apply(&self, columns: &[f32], out: &mut [f32]) {
        let rows = self.weights.rows;
        let cols = self.weights.cols;
        let patches = if cols == 0 { 0 } else { columns.len() / cols };
        let row_len = self.weights.row_len();

        match &self.compute {
            Compute::F32 | Compute::F16 => {
                let half = self.compute == Compute::F16;
                let columns: Cow<'_, [f32]> = if half {
                    Cow::Owned(columns.iter().map(|&v| round_f16(v)).collect())
                } else {
                    Cow::Borrowed(columns)
                };
                let Some(values) = self.weights.float_values() else {
                    return;
                };
                let kernel = DotKernel::detect();
                for row in 0..rows {
                    let weights = &values[row * row_len..(row + 1) * row_len];
                    let out_row = &mut out[row * patches..(row + 1) * patches];
                    for (p, value) in out_row.iter_mut().enumerate() {
                        let patch = &columns[p * cols..(p + 1) * cols];
                        let acc = match &self.weights.layout {
                            Layout::Dense => dot(kernel, weights, patch),
                            Layout::Sparse24 { offsets } => sparse_dot(
                                weights,
                                &offsets[row * row_len..(row + 1) * row_len],
                                patch,
                                |w, x| w * x,
                            ),
                        };
                        let y = acc + self.bias[row];
                        *value = if half { round_f16(y) } else { y };
                    }
                }
            }
            Compute::Int8 {
                input_scale,
                input_qmax,
                weight_scales,
            } => {
                let Storage::I8(values) = &self.weights.storage else {
                    return;
                };
                let qcolumns: Vec<i8> = columns
                    .iter()
                    .map(|&v| quantize(v, *input_scale, *input_qmax))
                    .collect();
                for row in 0..rows {
                    let weights = &values[row * row_len..(row + 1) * row_len];
                    let rescale = input_scale * weight_scales[row];
                    let out_row = &mut out[row * patches..(row + 1) * patches];
                    for (p, value) in out_row.iter_mut().enumerate() {
                        let patch = &qcolumns[p * cols..(p + 1) * cols];
                        let acc = match &self.weights.layout {
                            Layout::Dense => dot_i8(weights, patch),
                            Layout::Sparse24 { offsets } => sparse_dot(
                                weights,
                                &offsets[row * row_len..(row + 1) * row_len],
                                patch,
                                |w: i8, x: i8| i32::from(w) * i32::from(x),
                            ),
                        };
                        *value = acc as f32 * rescale + self.bias[row];
                    }
                }
            }
        }

        if self.relu {
            for value in out.iter_mut() {
                *value = value.max(0.0);
            }
        }
    }

    pub(crate) fn is_consistent(&self) -> bool {
        let rows = self.weights.rows;
        let storage_ok = match (&self.compute, &self.weights.storage) {
            (Compute::F32, Storage::F32(_)) | (Compute::F16, Storage::F16(_)) => true,
            (Compute::Int8 { weight_scales, .. }, Storage::I8(_)) => weight_scales.len() == rows,
            _ => false,
        };
        storage_ok && self.bias.len() == rows && self.weights.is_consistent()
    }
}
