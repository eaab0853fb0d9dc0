//! Diagnostics describing what the sparsifier did to each module.

use serde::Serialize;

use super::weight_norm_sparsifier::WeightNormSparsifier;
use crate::errors::{SparsityError, SparsityResult};
use crate::model::Network;

/// Configured and measured sparsity of a single module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SparseParams {
    pub sparsity_level: f32,
    pub zeros_per_block: usize,
    pub sparse_block_shape: (usize, usize),
    /// Fraction of weights that are exactly zero.
    pub true_sparsity_level: f32,
    /// The module uses the 2:4 configuration and its weights satisfy it.
    pub nvidia_style_sparsity: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleSparsity {
    pub fqn: String,
    pub params: SparseParams,
}

/// One entry per module group of the sparsifier, in forward order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SparseParamsReport {
    pub modules: Vec<ModuleSparsity>,
}

impl SparseParamsReport {
    pub fn get(&self, fqn: &str) -> Option<&SparseParams> {
        self.modules
            .iter()
            .find(|module| module.fqn == fqn)
            .map(|module| &module.params)
    }
}

/// Builds the report for every module group registered with `sparsifier`.
pub fn sparse_params(
    sparsifier: &WeightNormSparsifier,
    model: &Network,
) -> SparsityResult<SparseParamsReport> {
    let mut report = SparseParamsReport::default();
    for group in sparsifier.module_groups() {
        let weight = model
            .weight(&group.fqn)
            .map_err(|_| SparsityError::UnknownModule {
                name: group.fqn.clone(),
            })?;
        let zeros = weight.iter().filter(|&&w| w == 0.0).count();
        let true_sparsity_level = if weight.is_empty() {
            0.0
        } else {
            zeros as f32 / weight.len() as f32
        };

        report.modules.push(ModuleSparsity {
            fqn: group.fqn.clone(),
            params: SparseParams {
                sparsity_level: group.config.sparsity_level,
                zeros_per_block: group.config.zeros_per_block,
                sparse_block_shape: group.config.sparse_block_shape,
                true_sparsity_level,
                nvidia_style_sparsity: group.config.is_two_four()
                    && is_two_four_sparse(weight, group.cols),
            },
        });
    }
    Ok(report)
}

/// Whether every group of four consecutive weights in each row holds at least
/// two zeros. A shorter tail group must hold `min(2, len)` zeros.
pub fn is_two_four_sparse(weight: &[f32], cols: usize) -> bool {
    if cols == 0 {
        return weight.is_empty();
    }
    weight.chunks(cols).all(|row| {
        row.chunks(4).all(|group| {
            let zeros = group.iter().filter(|&&w| w == 0.0).count();
            zeros >= group.len().min(2)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_two_four_pattern() {
        assert!(is_two_four_sparse(&[0.0, 1.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0], 8));
        assert!(!is_two_four_sparse(&[0.0, 1.0, 5.0, 2.0], 4));
        // groups restart at every row
        assert!(!is_two_four_sparse(&[0.0, 0.0, 1.0, 0.0, 1.0, 1.0], 3));
    }
}
