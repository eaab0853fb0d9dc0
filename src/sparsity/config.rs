//! Sparsifier configuration.

use serde::{Deserialize, Serialize};

use crate::errors::{SparsityError, SparsityResult};

/// Parameters of the weight-norm sparsifier.
///
/// Weights are tiled into blocks of `sparse_block_shape` (rows, cols). The
/// `sparsity_level` fraction of blocks with the lowest L2 norm is sparsified,
/// and inside each of them the `zeros_per_block` smallest-magnitude weights are
/// zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsityConfig {
    pub sparsity_level: f32,
    pub sparse_block_shape: (usize, usize),
    pub zeros_per_block: usize,
}

impl Default for SparsityConfig {
    /// The 2:4 pattern: every block of four consecutive weights of a row holds at
    /// least two zeros.
    fn default() -> Self {
        Self {
            sparsity_level: 1.0,
            sparse_block_shape: (1, 4),
            zeros_per_block: 2,
        }
    }
}

impl SparsityConfig {
    pub fn validate(&self) -> SparsityResult<()> {
        if !(0.0..=1.0).contains(&self.sparsity_level) {
            return Err(SparsityError::InvalidConfig {
                field: "sparsity_level".to_string(),
                message: format!("{} is outside [0, 1]", self.sparsity_level),
            });
        }
        let (block_rows, block_cols) = self.sparse_block_shape;
        if block_rows == 0 || block_cols == 0 {
            return Err(SparsityError::InvalidConfig {
                field: "sparse_block_shape".to_string(),
                message: "block dimensions must be greater than 0".to_string(),
            });
        }
        if self.zeros_per_block > block_rows * block_cols {
            return Err(SparsityError::InvalidConfig {
                field: "zeros_per_block".to_string(),
                message: format!(
                    "{} zeros do not fit in a {}x{} block",
                    self.zeros_per_block, block_rows, block_cols
                ),
            });
        }
        Ok(())
    }

    /// Whether this configuration produces the accelerator-friendly 2:4 pattern.
    pub fn is_two_four(&self) -> bool {
        self.sparsity_level == 1.0 && self.zeros_per_block == 2 && self.sparse_block_shape == (1, 4)
    }
}
