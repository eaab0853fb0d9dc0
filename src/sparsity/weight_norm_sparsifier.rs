//! Weight-norm based block sparsifier.

use log::debug;

use super::config::SparsityConfig;
use crate::errors::{SparsityError, SparsityResult};
use crate::model::Network;

#[derive(Debug, Clone, PartialEq)]
enum MaskState {
    Pending,
    Computed(Vec<bool>),
    Squashed,
}

/// A weighted layer registered with the sparsifier.
#[derive(Debug, Clone)]
pub struct ModuleGroup {
    pub fqn: String,
    pub rows: usize,
    pub cols: usize,
    pub config: SparsityConfig,
    state: MaskState,
}

impl ModuleGroup {
    /// The computed keep-mask (`true` keeps the weight), if `step` ran and the
    /// mask has not been squashed yet.
    pub fn mask(&self) -> Option<&[bool]> {
        match &self.state {
            MaskState::Computed(mask) => Some(mask),
            _ => None,
        }
    }

    pub fn is_squashed(&self) -> bool {
        self.state == MaskState::Squashed
    }
}

pub struct WeightNormSparsifier {
    defaults: SparsityConfig,
    groups: Vec<ModuleGroup>,
}

impl WeightNormSparsifier {
    pub fn new(defaults: SparsityConfig) -> SparsityResult<Self> {
        defaults.validate()?;
        Ok(Self {
            defaults,
            groups: Vec::new(),
        })
    }

    pub fn module_groups(&self) -> &[ModuleGroup] {
        &self.groups
    }

    /// Registers the layers named in `config`, or every weighted layer when
    /// `config` is `None`.
    pub fn prepare(&mut self, model: &Network, config: Option<&[String]>) -> SparsityResult<()> {
        let views = model.weighted_layers();
        let selected: Vec<String> = match config {
            Some(names) => {
                for name in names {
                    if !views.iter().any(|view| &view.name == name) {
                        return Err(SparsityError::UnknownModule { name: name.clone() });
                    }
                }
                names.to_vec()
            }
            None => views.iter().map(|view| view.name.clone()).collect(),
        };

        self.groups = views
            .iter()
            .filter(|view| selected.contains(&view.name))
            .map(|view| ModuleGroup {
                fqn: view.name.clone(),
                rows: view.rows,
                cols: view.cols,
                config: self.defaults,
                state: MaskState::Pending,
            })
            .collect();
        debug!("Sparsifier prepared {} module groups", self.groups.len());
        Ok(())
    }

    /// Computes the mask of every group from the current weights.
    pub fn step(&mut self, model: &Network) -> SparsityResult<()> {
        if self.groups.is_empty() {
            return Err(SparsityError::NotPrepared);
        }
        for group in &mut self.groups {
            let weight = model
                .weight(&group.fqn)
                .map_err(|_| SparsityError::UnknownModule {
                    name: group.fqn.clone(),
                })?;
            if weight.len() != group.rows * group.cols {
                return Err(SparsityError::MaskSizeMismatch {
                    name: group.fqn.clone(),
                    mask_len: group.rows * group.cols,
                    weight_len: weight.len(),
                });
            }
            let mask = compute_mask(weight, group.rows, group.cols, &group.config);
            group.state = MaskState::Computed(mask);
        }
        Ok(())
    }

    /// Multiplies every registered weight by its mask, leaving dense zeros.
    pub fn squash_mask(&mut self, model: &mut Network) -> SparsityResult<()> {
        if self.groups.is_empty() {
            return Err(SparsityError::NotPrepared);
        }
        if self
            .groups
            .iter()
            .any(|group| !matches!(group.state, MaskState::Computed(_)))
        {
            return Err(SparsityError::NotStepped);
        }

        let mut views = model.weighted_layers_mut();
        for group in &mut self.groups {
            let view = views
                .iter_mut()
                .find(|view| view.name == group.fqn)
                .ok_or_else(|| SparsityError::UnknownModule {
                    name: group.fqn.clone(),
                })?;
            if let MaskState::Computed(mask) = &group.state {
                if mask.len() != view.weight.len() {
                    return Err(SparsityError::MaskSizeMismatch {
                        name: group.fqn.clone(),
                        mask_len: mask.len(),
                        weight_len: view.weight.len(),
                    });
                }
                for (w, &keep) in view.weight.iter_mut().zip(mask) {
                    if !keep {
                        *w = 0.0;
                    }
                }
            }
            group.state = MaskState::Squashed;
        }
        Ok(())
    }
}

/// Keep-mask for a `rows x cols` weight under `config`.
fn compute_mask(weight: &[f32], rows: usize, cols: usize, config: &SparsityConfig) -> Vec<bool> {
    let (block_rows, block_cols) = config.sparse_block_shape;
    let mut mask = vec![true; weight.len()];

    // Element indices of every (possibly partial) block, row-major over the tiling.
    let mut blocks: Vec<Vec<usize>> = Vec::new();
    for r0 in (0..rows).step_by(block_rows) {
        for c0 in (0..cols).step_by(block_cols) {
            let mut members = Vec::with_capacity(block_rows * block_cols);
            for r in r0..(r0 + block_rows).min(rows) {
                for c in c0..(c0 + block_cols).min(cols) {
                    members.push(r * cols + c);
                }
            }
            blocks.push(members);
        }
    }

    let num_sparse = (config.sparsity_level * blocks.len() as f32).ceil() as usize;
    let mut order: Vec<(usize, f32)> = blocks
        .iter()
        .enumerate()
        .map(|(i, members)| {
            let norm = members.iter().map(|&idx| weight[idx] * weight[idx]).sum::<f32>();
            (i, norm)
        })
        .collect();
    order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    for &(block_index, _) in order.iter().take(num_sparse.min(blocks.len())) {
        let mut members = blocks[block_index].clone();
        members.sort_by(|&a, &b| weight[a].abs().total_cmp(&weight[b].abs()).then(a.cmp(&b)));
        let zeros = config.zeros_per_block.min(members.len());
        for &idx in members.iter().take(zeros) {
            mask[idx] = false;
        }
    }

    mask
}
