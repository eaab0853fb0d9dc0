//! Tests for the engine builder, the compiled engine and its serialized plan.

use sparse_quant_bench::engine::{
    BuildFlags, BuilderSettings, ENGINE_PLAN_MAGIC, ENGINE_PLAN_VERSION, Engine, EngineBuilder, EngineModule,
    InputTensorSpec, StepKind,
};
use sparse_quant_bench::errors::{CompileError, RuntimeError};
use sparse_quant_bench::model::{ArchConfig, Network};
use sparse_quant_bench::quantization::{
    CALIBRATION_PASSES, QConfig, QConfigMap, QuantMode, QuantizedNetwork, calibrate, convert,
    prepare,
};
use sparse_quant_bench::runtime::Forward;
use sparse_quant_bench::sparsity::post_training_sparsify;
use sparse_quant_bench::tensor::Tensor;
use sparse_quant_bench::tracer::trace;

const DELTA: f32 = 0.0001;
const ITEM: [usize; 3] = [3, 32, 32];

fn small_model(seed: u64) -> Network {
    let arch = ArchConfig {
        input_channels: 3,
        stem_channels: 4,
        stage_channels: vec![4, 8],
        num_classes: 3,
    };
    Network::resnet_like(arch, seed).unwrap()
}

fn sample() -> Tensor {
    Tensor::randn(vec![1, 3, 32, 32], 21)
}

fn quantize_model(model: Network, mode: QuantMode) -> QuantizedNetwork {
    let qconfig = match mode {
        QuantMode::Explicit => QConfig::explicit_int8(),
        QuantMode::Implicit => QConfig::implicit_int8(),
    };
    let mut prepared = prepare(model, &QConfigMap::global(qconfig)).unwrap();
    calibrate(&mut prepared, &sample(), CALIBRATION_PASSES).unwrap();
    convert(prepared, mode).unwrap()
}

fn build_float(model: &Network, flags: BuildFlags) -> Engine {
    let graph = trace(model, &sample()).unwrap();
    EngineBuilder::new(graph, vec![InputTensorSpec::item(&ITEM)], BuilderSettings::default())
        .run(flags)
        .unwrap()
        .engine
}

#[cfg(test)]
mod float_engine_tests {
    use super::*;

    #[test]
    fn test_f32_engine_matches_network() {
        let model = small_model(3);
        let engine = build_float(&model, BuildFlags::default());
        let input = Tensor::randn(vec![2, 3, 32, 32], 4);

        let expected = model.forward(&input).unwrap();
        let actual = engine.execute(&input).unwrap();
        assert!(expected.max_abs_diff(&actual).unwrap() < DELTA);
    }

    #[test]
    fn test_relus_are_fused() {
        let model = small_model(3);
        let engine = build_float(&model, BuildFlags::default());
        assert!(!engine.steps().iter().any(|step| matches!(step.kind, StepKind::Relu)));
    }

    #[test]
    fn test_sparse_engine_matches_dense_engine() {
        let mut model = small_model(5);
        post_training_sparsify(&mut model, None, false).unwrap();

        let dense = build_float(&model, BuildFlags::default());
        let sparse = build_float(
            &model,
            BuildFlags {
                sparse_weight: true,
                ..BuildFlags::default()
            },
        );
        assert_eq!(dense.sparse_layers(), 0);
        assert_eq!(sparse.sparse_layers(), model.weighted_layers().len());

        let input = Tensor::randn(vec![3, 3, 32, 32], 6);
        let a = dense.execute(&input).unwrap();
        let b = sparse.execute(&input).unwrap();
        assert!(a.max_abs_diff(&b).unwrap() < DELTA);
    }

    #[test]
    fn test_dense_weights_stay_dense_under_sparse_flag() {
        let model = small_model(5);
        let engine = build_float(
            &model,
            BuildFlags {
                sparse_weight: true,
                ..BuildFlags::default()
            },
        );
        assert_eq!(engine.sparse_layers(), 0);
    }

    #[test]
    fn test_fp16_engine_is_close_to_network() {
        let model = small_model(8);
        let engine = build_float(
            &model,
            BuildFlags {
                fp16_mode: true,
                ..BuildFlags::default()
            },
        );
        let input = Tensor::randn(vec![1, 3, 32, 32], 9);
        let expected = model.forward(&input).unwrap();
        let actual = engine.execute(&input).unwrap();
        let diff = expected.max_abs_diff(&actual).unwrap();
        assert!(diff <= 1e-2 + 1e-2 * expected.max_abs(), "fp16 diff {}", diff);
    }
}

#[cfg(test)]
mod batch_range_tests {
    use super::*;

    #[test]
    fn test_implicit_batch_admits_up_to_max_batch_size() {
        let engine = build_float(&small_model(1), BuildFlags::default());
        let range = engine.batch_range();
        assert_eq!((range.min, range.max), (1, 64));
        assert_eq!(engine.item_shape(), &ITEM);
        assert!(matches!(
            engine.execute(&Tensor::randn(vec![65, 3, 32, 32], 0)),
            Err(RuntimeError::BatchOutOfRange { batch: 65, min: 1, max: 64 })
        ));
    }

    #[test]
    fn test_explicit_batch_range_is_enforced() {
        let quantized = quantize_model(small_model(2), QuantMode::Explicit);
        let graph = trace(&quantized, &sample()).unwrap();
        let settings = BuilderSettings {
            explicit_batch_dimension: true,
            explicit_precision: true,
            ..BuilderSettings::default()
        };
        let flags = BuildFlags {
            int8_mode: true,
            ..BuildFlags::default()
        };
        let result = EngineBuilder::new(
            graph,
            vec![InputTensorSpec::dynamic_batch(&ITEM, 1, 5, 10)],
            settings,
        )
        .run(flags)
        .unwrap();
        let engine = &result.engine;
        assert_eq!(engine.batch_range().opt, 5);

        assert!(engine.execute(&Tensor::randn(vec![10, 3, 32, 32], 1)).is_ok());
        assert!(matches!(
            engine.execute(&Tensor::randn(vec![11, 3, 32, 32], 1)),
            Err(RuntimeError::BatchOutOfRange { batch: 11, .. })
        ));
        assert!(matches!(
            engine.execute(&Tensor::randn(vec![2, 3, 16, 16], 1)),
            Err(RuntimeError::InputShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dynamic_spec_without_explicit_batch_fails() {
        let graph = trace(&small_model(1), &sample()).unwrap();
        let result = EngineBuilder::new(
            graph,
            vec![InputTensorSpec::dynamic_batch(&ITEM, 1, 5, 10)],
            BuilderSettings::default(),
        )
        .run(BuildFlags::default());
        assert!(matches!(
            result,
            Err(CompileError::DynamicBatchRequiresExplicitBatch { .. })
        ));
    }

    #[test]
    fn test_exactly_one_input_spec_is_required() {
        let graph = trace(&small_model(1), &sample()).unwrap();
        let result = EngineBuilder::new(graph, Vec::new(), BuilderSettings::default())
            .run(BuildFlags::default());
        assert!(matches!(
            result,
            Err(CompileError::InputCountMismatch { expected: 1, actual: 0 })
        ));
    }
}

#[cfg(test)]
mod int8_engine_tests {
    use super::*;

    #[test]
    fn test_explicit_engine_tracks_quantized_reference() {
        let quantized = quantize_model(small_model(12), QuantMode::Explicit);
        let graph = trace(&quantized, &sample()).unwrap();
        let settings = BuilderSettings {
            explicit_batch_dimension: true,
            explicit_precision: true,
            ..BuilderSettings::default()
        };
        let flags = BuildFlags {
            int8_mode: true,
            ..BuildFlags::default()
        };
        let result = EngineBuilder::new(
            graph,
            vec![InputTensorSpec::dynamic_batch(&ITEM, 1, 5, 10)],
            settings,
        )
        .run(flags)
        .unwrap();
        let module = EngineModule::new(result).unwrap();

        let reference = quantized.forward(&sample()).unwrap();
        let output = module.forward(&sample()).unwrap();
        let diff = reference.max_abs_diff(&output).unwrap();
        assert!(diff <= 0.1 + 0.25 * reference.max_abs(), "int8 diff {}", diff);
    }

    #[test]
    fn test_qdq_graph_requires_explicit_precision() {
        let quantized = quantize_model(small_model(12), QuantMode::Explicit);
        let graph = trace(&quantized, &sample()).unwrap();
        let result = EngineBuilder::new(graph, vec![InputTensorSpec::item(&ITEM)], BuilderSettings::default())
            .run(BuildFlags {
                int8_mode: true,
                ..BuildFlags::default()
            });
        assert!(matches!(result, Err(CompileError::ExplicitPrecisionRequired)));
    }

    #[test]
    fn test_strict_int8_without_ranges_fails() {
        let graph = trace(&small_model(12), &sample()).unwrap();
        let result = EngineBuilder::new(graph, vec![InputTensorSpec::item(&ITEM)], BuilderSettings::default())
            .run(BuildFlags {
                int8_mode: true,
                strict_type_constraints: true,
                ..BuildFlags::default()
            });
        assert!(matches!(
            result,
            Err(CompileError::MissingDynamicRange { ref node }) if node == "stem"
        ));
    }

    #[test]
    fn test_implicit_engine_builds_from_ranges() {
        let quantized = quantize_model(small_model(13), QuantMode::Implicit);
        let graph = trace(&quantized, &sample()).unwrap();
        let specs = InputTensorSpec::from_tensors(&[&sample()]);
        let result = EngineBuilder::new(graph, specs, BuilderSettings::default())
            .run(BuildFlags {
                int8_mode: true,
                strict_type_constraints: true,
                ..BuildFlags::default()
            })
            .unwrap();
        let output = result.engine.execute(&Tensor::randn(vec![5, 3, 32, 32], 3)).unwrap();
        assert_eq!(output.shape(), &[5, 3]);
    }
}

#[cfg(test)]
mod plan_tests {
    use super::*;

    fn sparse_fp16_engine() -> Engine {
        let mut model = small_model(30);
        post_training_sparsify(&mut model, None, false).unwrap();
        build_float(
            &model,
            BuildFlags {
                fp16_mode: true,
                sparse_weight: true,
                ..BuildFlags::default()
            },
        )
    }

    #[test]
    fn test_plan_round_trip_preserves_outputs() {
        let engine = sparse_fp16_engine();
        let restored = Engine::deserialize(&engine.serialize().unwrap()).unwrap();

        assert_eq!(restored.flags(), engine.flags());
        assert_eq!(restored.batch_range(), engine.batch_range());
        assert_eq!(restored.sparse_layers(), engine.sparse_layers());

        let input = Tensor::randn(vec![2, 3, 32, 32], 31);
        let a = engine.execute(&input).unwrap();
        let b = restored.execute(&input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_save_and_load() {
        let engine = sparse_fp16_engine();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.plan");
        engine.save(&path).unwrap();

        let loaded = Engine::load(&path).unwrap();
        let input = Tensor::randn(vec![1, 3, 32, 32], 32);
        assert_eq!(engine.execute(&input).unwrap(), loaded.execute(&input).unwrap());
    }

    #[test]
    fn test_plan_with_bad_magic_is_rejected() {
        let mut bytes = sparse_fp16_engine().serialize().unwrap();
        assert_eq!(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), ENGINE_PLAN_MAGIC);
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Engine::deserialize(&bytes),
            Err(CompileError::InvalidPlan { .. })
        ));
    }

    /// Re-frames an edited JSON payload behind a well-formed header.
    fn reframe(payload: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + payload.len());
        bytes.extend_from_slice(&ENGINE_PLAN_MAGIC.to_ne_bytes());
        bytes.extend_from_slice(&ENGINE_PLAN_VERSION.to_ne_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_ne_bytes());
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    fn plan_payload(engine: &Engine) -> String {
        let bytes = engine.serialize().unwrap();
        String::from_utf8(bytes[16..].to_vec()).unwrap()
    }

    #[test]
    fn test_reframed_plan_is_accepted() {
        let engine = build_float(&small_model(7), BuildFlags::default());
        let restored = Engine::deserialize(&reframe(&plan_payload(&engine))).unwrap();
        let input = Tensor::randn(vec![1, 3, 32, 32], 8);
        assert_eq!(engine.execute(&input).unwrap(), restored.execute(&input).unwrap());
    }

    #[test]
    fn test_plan_with_mismatched_linear_features_is_rejected() {
        let engine = build_float(&small_model(7), BuildFlags::default());
        let payload = plan_payload(&engine);
        assert_eq!(payload.matches("\"out_features\":3").count(), 1);
        let tampered = payload.replace("\"out_features\":3", "\"out_features\":2");

        assert!(matches!(
            Engine::deserialize(&reframe(&tampered)),
            Err(CompileError::InvalidPlan { ref message }) if message.contains("fc")
        ));
    }

    #[test]
    fn test_plan_with_mismatched_conv_channels_is_rejected() {
        let engine = build_float(&small_model(7), BuildFlags::default());
        let payload = plan_payload(&engine);
        let tampered = payload.replacen("\"in_channels\":3", "\"in_channels\":1", 1);
        assert_ne!(tampered, payload);

        assert!(matches!(
            Engine::deserialize(&reframe(&tampered)),
            Err(CompileError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_truncated_plan_is_rejected() {
        let bytes = sparse_fp16_engine().serialize().unwrap();
        assert!(matches!(
            Engine::deserialize(&bytes[..bytes.len() - 1]),
            Err(CompileError::InvalidPlan { .. })
        ));
        assert!(matches!(
            Engine::deserialize(&bytes[..4]),
            Err(CompileError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_module_rejects_mismatched_bindings() {
        let graph = trace(&small_model(1), &sample()).unwrap();
        let mut result = EngineBuilder::new(graph, vec![InputTensorSpec::item(&ITEM)], BuilderSettings::default())
            .run(BuildFlags::default())
            .unwrap();
        result.input_names = vec!["x".to_string()];
        assert!(matches!(
            EngineModule::new(result),
            Err(RuntimeError::BindingMismatch { .. })
        ));
    }
}
