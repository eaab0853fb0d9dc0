//! Dense f32 tensors in NCHW layout.

use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, ModelResult};

/// A dense row-major tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that the shape holds exactly `data.len()` elements.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> ModelResult<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(ModelError::InvalidTensorShape {
                shape,
                data_len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Deterministic standard-normal tensor.
    ///
    /// Uses a 64-bit LCG with a Box-Muller transform so the same seed always
    /// produces the same tensor on every platform.
    pub fn randn(shape: Vec<usize>, seed: u64) -> Self {
        let len: usize = shape.iter().product();
        let mut rng = Lcg::new(seed);
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let (z0, z1) = rng.next_gaussian_pair();
            data.push(z0);
            if data.len() < len {
                data.push(z1);
            }
        }
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Leading (batch) dimension, 1 for a scalar.
    pub fn batch(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Copies batch item `index` out as a tensor with a batch dimension of 1.
    pub fn batch_item(&self, index: usize) -> Option<Tensor> {
        let batch = self.batch();
        if index >= batch || self.shape.is_empty() {
            return None;
        }
        let item_len = self.data.len() / batch;
        let mut shape = self.shape.clone();
        shape[0] = 1;
        Some(Self {
            shape,
            data: self.data[index * item_len..(index + 1) * item_len].to_vec(),
        })
    }

    /// Largest absolute value in the tensor.
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    /// Largest element-wise absolute difference, or `None` when shapes differ.
    /// Any non-finite element in either tensor makes the difference NaN.
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        let mut max = 0.0f32;
        for (a, b) in self.data.iter().zip(other.data.iter()) {
            if !a.is_finite() || !b.is_finite() {
                return Some(f32::NAN);
            }
            max = max.max((a - b).abs());
        }
        Some(max)
    }
}

/// Linear congruential generator (Knuth MMIX constants).
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform sample in the open interval (0, 1).
    pub fn next_unit(&mut self) -> f32 {
        let bits = (self.next_u64() >> 40) as u32; // 24 significant bits
        (bits as f32 + 0.5) / (1u32 << 24) as f32
    }

    pub fn next_gaussian_pair(&mut self) -> (f32, f32) {
        let u1 = self.next_unit();
        let u2 = self.next_unit();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        (radius * theta.cos(), radius * theta.sin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randn_is_deterministic_per_seed() {
        let a = Tensor::randn(vec![2, 3, 4, 4], 7);
        let b = Tensor::randn(vec![2, 3, 4, 4], 7);
        let c = Tensor::randn(vec![2, 3, 4, 4], 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn randn_has_roughly_unit_variance() {
        let t = Tensor::randn(vec![1, 3, 64, 64], 1);
        let n = t.len() as f32;
        let mean = t.data().iter().sum::<f32>() / n;
        let var = t.data().iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance {}", var);
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(Tensor::new(vec![2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn batch_item_and_diff() {
        let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, -4.0]).unwrap();
        let item = t.batch_item(1).unwrap();
        assert_eq!(item.shape(), &[1, 2]);
        assert_eq!(item.data(), &[3.0, -4.0]);
        assert_eq!(t.max_abs(), 4.0);
        let u = Tensor::new(vec![2, 2], vec![1.0, 2.5, 3.0, -4.0]).unwrap();
        assert_eq!(t.max_abs_diff(&u), Some(0.5));
        assert_eq!(t.max_abs_diff(&item), None);
    }

    #[test]
    fn non_finite_values_poison_the_diff() {
        let t = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let nan = Tensor::new(vec![3], vec![1.0, f32::NAN, 3.0]).unwrap();
        let inf = Tensor::new(vec![3], vec![f32::INFINITY, 2.0, 3.0]).unwrap();
        assert!(t.max_abs_diff(&nan).unwrap().is_nan());
        assert!(nan.max_abs_diff(&t).unwrap().is_nan());
        assert!(t.max_abs_diff(&inf).unwrap().is_nan());
        assert!(nan.max_abs_diff(&nan).unwrap().is_nan());
    }
}
