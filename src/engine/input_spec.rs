//! Input bindings of an engine and the batch range they admit.

use serde::{Deserialize, Serialize};

use crate::errors::{CompileError, CompileResult};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F16,
}

/// `(min, opt, max)` shapes of a dynamic input.
pub type ShapeRange = (Vec<usize>, Vec<usize>, Vec<usize>);

/// Description of one engine input.
///
/// `-1` in `shape` marks the dynamic batch dimension, whose bounds come from
/// `shape_ranges`. With `has_batch_dim == false` the shape describes a single
/// item and the batch is implicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTensorSpec {
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub has_batch_dim: bool,
    #[serde(default)]
    pub shape_ranges: Vec<ShapeRange>,
}

/// Batch sizes an engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub min: usize,
    pub opt: usize,
    pub max: usize,
}

impl BatchRange {
    pub fn contains(&self, batch: usize) -> bool {
        (self.min..=self.max).contains(&batch)
    }
}

impl InputTensorSpec {
    /// Static spec of a single item (no batch dimension).
    pub fn item(shape: &[usize]) -> Self {
        Self {
            shape: shape.iter().map(|&d| d as i64).collect(),
            dtype: DType::F32,
            has_batch_dim: false,
            shape_ranges: Vec::new(),
        }
    }

    /// Static specs matching sample tensors, batch dimension included.
    pub fn from_tensors(tensors: &[&Tensor]) -> Vec<Self> {
        tensors
            .iter()
            .map(|tensor| Self {
                shape: tensor.shape().iter().map(|&d| d as i64).collect(),
                dtype: DType::F32,
                has_batch_dim: true,
                shape_ranges: Vec::new(),
            })
            .collect()
    }

    /// Spec with a dynamic batch dimension in `min..=max` around `item_shape`.
    pub fn dynamic_batch(item_shape: &[usize], min: usize, opt: usize, max: usize) -> Self {
        let with_batch = |batch: usize| {
            let mut shape = vec![batch];
            shape.extend_from_slice(item_shape);
            shape
        };
        let mut shape = vec![-1];
        shape.extend(item_shape.iter().map(|&d| d as i64));
        Self {
            shape,
            dtype: DType::F32,
            has_batch_dim: true,
            shape_ranges: vec![(with_batch(min), with_batch(opt), with_batch(max))],
        }
    }

    fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|&d| d < 0)
    }

    /// Checks the spec against the traced input shape (`[N, C, H, W]`) and
    /// resolves the batch range the engine will accept.
    pub(crate) fn resolve(
        &self,
        traced: &[usize],
        explicit_batch_dimension: bool,
        max_batch_size: usize,
    ) -> CompileResult<BatchRange> {
        let mismatch = || CompileError::InputSpecMismatch {
            spec: self.shape.clone(),
            traced: traced.to_vec(),
        };
        let item = traced.get(1..).ok_or_else(mismatch)?;

        let spec_item: &[i64] = if self.has_batch_dim {
            self.shape.get(1..).ok_or_else(mismatch)?
        } else {
            &self.shape
        };
        let same_item = spec_item.len() == item.len()
            && spec_item.iter().zip(item).all(|(&s, &t)| s == t as i64);
        if !same_item {
            return Err(mismatch());
        }

        let implicit = || {
            if max_batch_size == 0 {
                return Err(CompileError::InvalidShapeRange {
                    message: "max_batch_size must be greater than 0".to_string(),
                });
            }
            Ok(BatchRange {
                min: 1,
                opt: max_batch_size,
                max: max_batch_size,
            })
        };

        if !self.has_batch_dim || !explicit_batch_dimension {
            // Implicit batch mode: the leading dimension is not part of the
            // network, any batch up to max_batch_size is accepted.
            if self.is_dynamic() {
                return Err(CompileError::DynamicBatchRequiresExplicitBatch {
                    spec: self.shape.clone(),
                });
            }
            return implicit();
        }

        match self.shape.first() {
            Some(&-1) => self.dynamic_range(item),
            Some(&batch) if batch > 0 => Ok(BatchRange {
                min: batch as usize,
                opt: batch as usize,
                max: batch as usize,
            }),
            _ => Err(mismatch()),
        }
    }

    fn dynamic_range(&self, item: &[usize]) -> CompileResult<BatchRange> {
        let invalid = |message: String| CompileError::InvalidShapeRange { message };
        let [(min, opt, max)] = self.shape_ranges.as_slice() else {
            return Err(invalid(format!(
                "dynamic spec {:?} needs exactly one (min, opt, max) range, got {}",
                self.shape,
                self.shape_ranges.len()
            )));
        };
        for shape in [min, opt, max] {
            if shape.len() != item.len() + 1 || shape[1..] != *item {
                return Err(invalid(format!(
                    "range shape {:?} does not match input item {:?}",
                    shape, item
                )));
            }
        }
        let range = BatchRange {
            min: min[0],
            opt: opt[0],
            max: max[0],
        };
        if range.min == 0 || range.min > range.opt || range.opt > range.max {
            return Err(invalid(format!(
                "batch range must satisfy 0 < min <= opt <= max, got {:?}",
                range
            )));
        }
        Ok(range)
    }
}
