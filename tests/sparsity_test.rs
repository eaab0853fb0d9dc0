//! Tests for post-training sparsification.
//!
//! Checks the 2:4 pattern on every weighted layer, the per-module report and
//! the prepare → step → squash_mask protocol of the sparsifier.

use sparse_quant_bench::errors::SparsityError;
use sparse_quant_bench::model::{ArchConfig, Network};
use sparse_quant_bench::sparsity::{
    SparsityConfig, WeightNormSparsifier, is_two_four_sparse, post_training_sparsify,
    sparse_params,
};
use sparse_quant_bench::tensor::Tensor;

fn small_arch() -> ArchConfig {
    ArchConfig {
        input_channels: 3,
        stem_channels: 4,
        stage_channels: vec![4, 8],
        num_classes: 3,
    }
}

#[cfg(test)]
mod post_training_sparsify_tests {
    use super::*;

    #[test]
    fn test_every_weighted_layer_is_two_four_sparse() {
        let mut model = Network::resnet_like(small_arch(), 7).unwrap();
        post_training_sparsify(&mut model, None, false).unwrap();

        for view in model.weighted_layers() {
            assert!(
                is_two_four_sparse(view.weight, view.cols),
                "{} violates the 2:4 pattern",
                view.name
            );
        }
    }

    #[test]
    fn test_report_covers_every_module() {
        let mut model = Network::resnet_like(small_arch(), 7).unwrap();
        let report = post_training_sparsify(&mut model, None, true).unwrap();

        let names: Vec<String> = model.weighted_layers().iter().map(|v| v.name.clone()).collect();
        let reported: Vec<String> = report.modules.iter().map(|m| m.fqn.clone()).collect();
        assert_eq!(reported, names);

        for module in &report.modules {
            assert_eq!(module.params.zeros_per_block, 2);
            assert_eq!(module.params.sparse_block_shape, (1, 4));
            assert!(module.params.nvidia_style_sparsity, "{}", module.fqn);
            assert!(module.params.true_sparsity_level >= 0.4, "{}", module.fqn);
        }
        assert!(report.get("fc").is_some());
        assert!(report.get("missing").is_none());
    }

    #[test]
    fn test_partial_sparsity_is_not_nvidia_style() {
        let mut model = Network::resnet_like(small_arch(), 3).unwrap();
        let config = SparsityConfig {
            sparsity_level: 0.5,
            ..SparsityConfig::default()
        };
        let report = post_training_sparsify(&mut model, Some(config), false).unwrap();

        let stem = report.get("stem").unwrap();
        assert!(!stem.nvidia_style_sparsity);
        assert!(stem.true_sparsity_level > 0.0);
        assert!(stem.true_sparsity_level < 0.5);
    }

    #[test]
    fn test_sparsified_model_still_runs() {
        let mut model = Network::resnet_like(small_arch(), 11).unwrap();
        post_training_sparsify(&mut model, None, false).unwrap();
        let output = model.forward(&Tensor::randn(vec![2, 3, 32, 32], 1)).unwrap();
        assert_eq!(output.shape(), &[2, 3]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut model = Network::resnet_like(small_arch(), 0).unwrap();
        let config = SparsityConfig {
            zeros_per_block: 5,
            ..SparsityConfig::default()
        };
        let result = post_training_sparsify(&mut model, Some(config), false);
        assert!(matches!(
            result,
            Err(SparsityError::InvalidConfig { ref field, .. }) if field == "zeros_per_block"
        ));
    }
}

#[cfg(test)]
mod sparsifier_protocol_tests {
    use super::*;

    #[test]
    fn test_step_before_prepare_fails() {
        let model = Network::resnet_like(small_arch(), 0).unwrap();
        let mut sparsifier = WeightNormSparsifier::new(SparsityConfig::default()).unwrap();
        assert!(matches!(sparsifier.step(&model), Err(SparsityError::NotPrepared)));
    }

    #[test]
    fn test_squash_before_step_fails() {
        let mut model = Network::resnet_like(small_arch(), 0).unwrap();
        let mut sparsifier = WeightNormSparsifier::new(SparsityConfig::default()).unwrap();
        sparsifier.prepare(&model, None).unwrap();
        assert!(matches!(
            sparsifier.squash_mask(&mut model),
            Err(SparsityError::NotStepped)
        ));
    }

    #[test]
    fn test_prepare_rejects_unknown_module() {
        let model = Network::resnet_like(small_arch(), 0).unwrap();
        let mut sparsifier = WeightNormSparsifier::new(SparsityConfig::default()).unwrap();
        let names = vec!["stage9.conv1".to_string()];
        assert!(matches!(
            sparsifier.prepare(&model, Some(&names)),
            Err(SparsityError::UnknownModule { ref name }) if name == "stage9.conv1"
        ));
    }

    #[test]
    fn test_only_selected_modules_are_sparsified() {
        let mut model = Network::resnet_like(small_arch(), 5).unwrap();
        let untouched = model.weight("fc").unwrap().to_vec();

        let mut sparsifier = WeightNormSparsifier::new(SparsityConfig::default()).unwrap();
        let names = vec!["stem".to_string()];
        sparsifier.prepare(&model, Some(&names)).unwrap();
        sparsifier.step(&model).unwrap();
        sparsifier.squash_mask(&mut model).unwrap();

        assert_eq!(sparsifier.module_groups().len(), 1);
        assert!(sparsifier.module_groups()[0].is_squashed());
        assert_eq!(model.weight("fc").unwrap(), untouched.as_slice());

        let report = sparse_params(&sparsifier, &model).unwrap();
        assert_eq!(report.modules.len(), 1);
        assert!(report.get("stem").unwrap().nvidia_style_sparsity);
    }
}
