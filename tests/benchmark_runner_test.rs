//! Tests for the benchmark runner: configuration loading, variant builds,
//! baseline isolation and end-to-end accuracy of the compiled engines.

use std::fs;

use sparse_quant_bench::benchmarks::{
    BASELINE_DEVICE_LABEL, BASELINE_HOST_LABEL, BenchConfig, BenchmarkError, BenchmarkRunner,
    ConfigLoader, Precision, Tolerance, VariantConfig,
};
use sparse_quant_bench::model::ArchConfig;
use sparse_quant_bench::quantization::QuantMode;
use sparse_quant_bench::runtime::Forward;
use sparse_quant_bench::sparsity::is_two_four_sparse;
use sparse_quant_bench::tensor::Tensor;

fn small_config() -> BenchConfig {
    BenchConfig {
        iterations: 2,
        input_shape: vec![3, 32, 32],
        arch: ArchConfig {
            input_channels: 3,
            stem_channels: 4,
            stage_channels: vec![4, 8],
            num_classes: 3,
        },
        ..BenchConfig::default()
    }
}

fn variant(precision: Precision, sparsify: bool, mode: Option<QuantMode>) -> VariantConfig {
    let mut builder = VariantConfig::builder().precision(precision).sparsify(sparsify);
    if let Some(mode) = mode {
        builder = builder.quant_mode(mode);
    }
    builder.build().unwrap()
}

#[cfg(test)]
mod config_loading_tests {
    use super::*;

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = ConfigLoader::load_bench_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config, BenchConfig::default());
        assert_eq!(config.variants.len(), 6);
    }

    #[test]
    fn test_partial_config_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        fs::write(&path, r#"{ "iterations": 7, "seed": 42 }"#).unwrap();

        let config = ConfigLoader::load_bench_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.iterations, 7);
        assert_eq!(config.seed, 42);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.explicit_batch_range, [1, 5, 10]);
    }

    #[test]
    fn test_malformed_config_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        fs::write(&path, "{ iterations: ").unwrap();

        let result = ConfigLoader::load_bench_config(path.to_str().unwrap());
        assert!(matches!(result, Err(BenchmarkError::ConfigParseError { .. })));
    }

    #[test]
    fn test_zero_iterations_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        fs::write(&path, r#"{ "iterations": 0 }"#).unwrap();

        let result = ConfigLoader::load_bench_config(path.to_str().unwrap());
        assert!(matches!(result, Err(BenchmarkError::InvalidIterations { value: 0 })));
    }

    #[test]
    fn test_unknown_variant_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        fs::write(&path, serde_json::to_string(&small_config()).unwrap()).unwrap();

        let result = BenchmarkRunner::run_from_config(path.to_str().unwrap(), Some("engine int4"));
        assert!(matches!(
            result,
            Err(BenchmarkError::UnknownVariant { ref label }) if label == "engine int4"
        ));
    }
}

#[cfg(test)]
mod isolation_tests {
    use super::*;

    #[test]
    fn test_variant_builds_leave_the_baseline_untouched() {
        let config = small_config();
        let baseline = BenchmarkRunner::baseline(&config).unwrap();
        let pristine = baseline.clone();

        for variant in VariantConfig::standard_suite() {
            BenchmarkRunner::build_variant(&baseline, &variant, &config).unwrap();
            assert_eq!(baseline, pristine, "{} mutated the baseline", variant.label());
        }
        for view in baseline.weighted_layers() {
            assert!(!is_two_four_sparse(view.weight, view.cols), "{}", view.name);
        }
    }

    #[test]
    fn test_baseline_is_reproducible_from_seed() {
        let config = small_config();
        let a = BenchmarkRunner::baseline(&config).unwrap();
        let b = BenchmarkRunner::baseline(&config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_checkpoint_baseline_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        let config = small_config();
        let seeded = BenchmarkRunner::baseline(&BenchConfig {
            seed: 99,
            ..config.clone()
        })
        .unwrap();
        seeded.save(&path).unwrap();

        let loaded = BenchmarkRunner::baseline(&BenchConfig {
            checkpoint: Some(path),
            ..config
        })
        .unwrap();
        assert_eq!(loaded, seeded);
    }
}

#[cfg(test)]
mod run_tests {
    use super::*;

    #[test]
    fn test_run_times_engines_then_baselines() {
        let config = small_config();
        let baseline = BenchmarkRunner::baseline(&config).unwrap();
        let variants = vec![
            variant(Precision::Fp16, true, None),
            variant(Precision::Int8, false, Some(QuantMode::Explicit)),
        ];

        let samples = BenchmarkRunner::run(&baseline, &variants, &config).unwrap();
        let labels: Vec<&str> = samples.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "engine sparse fp16",
                "engine int8",
                BASELINE_DEVICE_LABEL,
                BASELINE_HOST_LABEL,
            ]
        );
        assert!(samples.iter().all(|s| s.iterations == 2 && s.mean_ms > 0.0));
    }

    #[test]
    fn test_quantized_variants_report_reference_diff() {
        let config = small_config();
        let baseline = BenchmarkRunner::baseline(&config).unwrap();

        let fp16 = BenchmarkRunner::build_variant(&baseline, &variant(Precision::Fp16, false, None), &config)
            .unwrap();
        assert!(fp16.quant_diff.is_none());

        let int8 = variant(Precision::Int8, true, Some(QuantMode::Explicit));
        let built = BenchmarkRunner::build_variant(&baseline, &int8, &config).unwrap();
        assert_eq!(built.label, "engine sparse int8");
        assert!(built.module.engine().sparse_layers() > 0);
        let diff = built.quant_diff.unwrap();
        assert!(diff.is_finite());
    }

    #[test]
    fn test_non_finite_engine_output_is_out_of_tolerance() {
        let reference = Tensor::new(vec![1, 3], vec![0.5, -1.0, 2.0]).unwrap();
        let output = Tensor::new(vec![1, 3], vec![0.5, f32::NAN, 2.0]).unwrap();
        let diff = reference.max_abs_diff(&output).unwrap();
        assert!(diff.is_nan());

        let tolerance = Tolerance { abs: 1.0, rel: 1.0 };
        assert!(!tolerance.allows(diff, reference.max_abs()));
        assert!(tolerance.allows(0.0, reference.max_abs()));
    }
}

#[cfg(test)]
mod end_to_end_tests {
    use super::*;

    /// Full-size input through the default network.
    fn full_config() -> BenchConfig {
        BenchConfig {
            iterations: 1,
            ..BenchConfig::default()
        }
    }

    fn assert_within_tolerance(variant: VariantConfig) {
        let config = full_config();
        let baseline = BenchmarkRunner::baseline(&config).unwrap();
        let input = BenchmarkRunner::sample_input(&config);
        assert_eq!(input.shape(), &[1, 3, 224, 224]);

        let built = BenchmarkRunner::build_variant(&baseline, &variant, &config).unwrap();
        let expected = baseline.forward(&input).unwrap();
        let actual = built.module.forward(&input).unwrap();
        assert_eq!(actual.shape(), expected.shape());

        let diff = expected.max_abs_diff(&actual).unwrap();
        assert!(
            variant.tolerance().allows(diff, expected.max_abs()),
            "{} differs from the baseline by {}",
            built.label,
            diff
        );
    }

    #[test]
    fn test_fp16_engine_matches_baseline() {
        assert_within_tolerance(variant(Precision::Fp16, false, None));
    }

    #[test]
    fn test_explicit_int8_engine_matches_baseline() {
        assert_within_tolerance(variant(Precision::Int8, false, Some(QuantMode::Explicit)));
    }

    #[test]
    fn test_implicit_int8_engine_matches_baseline() {
        assert_within_tolerance(variant(Precision::Int8, false, Some(QuantMode::Implicit)));
    }
}
