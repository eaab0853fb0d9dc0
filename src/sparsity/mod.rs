//! Post-training weight sparsification.
//!
//! The sparsifier follows the prepare → step → squash_mask protocol: `prepare`
//! registers one module group per weighted layer, `step` computes block masks
//! from the current weight norms and `squash_mask` folds the masks into the
//! weights as dense zeros.

pub mod config;
pub mod report;
pub mod weight_norm_sparsifier;

pub use config::SparsityConfig;
pub use report::{
    ModuleSparsity, SparseParams, SparseParamsReport, is_two_four_sparse, sparse_params,
};
pub use weight_norm_sparsifier::{ModuleGroup, WeightNormSparsifier};

use log::info;

use crate::errors::SparsityResult;
use crate::model::Network;

/// Sparsifies every weighted layer of `model` in place.
///
/// Defaults to the 2:4 configuration. Returns the per-module report, which is
/// also logged when `verbose` is set.
pub fn post_training_sparsify(
    model: &mut Network,
    sparse_config: Option<SparsityConfig>,
    verbose: bool,
) -> SparsityResult<SparseParamsReport> {
    let config = sparse_config.unwrap_or_default();
    if verbose {
        info!(
            "Running post-training sparsity with the following parameters: {:?}",
            config
        );
    }

    let mut sparsifier = WeightNormSparsifier::new(config)?;
    sparsifier.prepare(model, None)?;
    sparsifier.step(model)?;
    sparsifier.squash_mask(model)?;

    let report = sparse_params(&sparsifier, model)?;
    if verbose {
        for module in &report.modules {
            info!("Sparse params [{}]: {:?}", module.fqn, module.params);
        }
    }
    Ok(report)
}
