//! Tests for post-training quantization: observer insertion, calibration and
//! conversion into per-channel int8 weights.

use sparse_quant_bench::errors::QuantizationError;
use sparse_quant_bench::model::{ArchConfig, Network};
use sparse_quant_bench::quantization::{
    CALIBRATION_PASSES, ObserverKind, QConfig, QConfigMap, QScheme, QuantMode, QuantizedNetwork,
    calibrate, convert, prepare,
};
use sparse_quant_bench::tensor::Tensor;

const DELTA: f32 = 0.00005;

fn small_model(seed: u64) -> Network {
    let arch = ArchConfig {
        input_channels: 3,
        stem_channels: 4,
        stage_channels: vec![4, 8],
        num_classes: 3,
    };
    Network::resnet_like(arch, seed).unwrap()
}

#[cfg(test)]
mod calibration_tests {
    use super::*;

    #[test]
    fn test_calibration_runs_exactly_the_requested_passes() {
        let model = small_model(1);
        let mut prepared = prepare(model, &QConfigMap::global(QConfig::explicit_int8())).unwrap();
        let sample = Tensor::randn(vec![1, 3, 32, 32], 2);

        calibrate(&mut prepared, &sample, CALIBRATION_PASSES).unwrap();
        assert_eq!(CALIBRATION_PASSES, 10);
        assert_eq!(prepared.calibration_passes(), 10);
        for view in prepared.network().weighted_layers() {
            let observer = prepared.observer(&view.name).unwrap();
            assert_eq!(observer.batches(), 10, "{}", view.name);
        }

        let quantized = convert(prepared, QuantMode::Explicit).unwrap();
        assert_eq!(quantized.calibration_passes(), 10);
    }

    #[test]
    fn test_convert_without_calibration_fails() {
        let prepared = prepare(small_model(1), &QConfigMap::global(QConfig::explicit_int8())).unwrap();
        assert!(matches!(
            convert(prepared, QuantMode::Explicit),
            Err(QuantizationError::NotCalibrated { passes: 0 })
        ));
    }

    #[test]
    fn test_excluded_modules_get_no_observer() {
        let map = QConfigMap::global(QConfig::explicit_int8()).set_module_name("fc", None);
        let mut prepared = prepare(small_model(4), &map).unwrap();
        assert!(prepared.observer("fc").is_none());
        assert!(prepared.observer("stem").is_some());

        calibrate(&mut prepared, &Tensor::randn(vec![1, 3, 32, 32], 5), 2).unwrap();
        let quantized = convert(prepared, QuantMode::Implicit).unwrap();
        assert!(quantized.layer("fc").is_none());
        assert!(quantized.layer("stem").is_some());
    }

    #[test]
    fn test_nothing_to_quantize_is_an_error() {
        let map = QConfigMap::default();
        assert!(matches!(
            prepare(small_model(0), &map),
            Err(QuantizationError::NoQuantizableLayers)
        ));
    }
}

#[cfg(test)]
mod conversion_tests {
    use super::*;

    fn quantized(mode: QuantMode) -> (Network, QuantizedNetwork, Tensor) {
        let model = small_model(9);
        let qconfig = match mode {
            QuantMode::Explicit => QConfig::explicit_int8(),
            QuantMode::Implicit => QConfig::implicit_int8(),
        };
        let sample = Tensor::randn(vec![1, 3, 32, 32], 10);
        let mut prepared = prepare(model.clone(), &QConfigMap::global(qconfig)).unwrap();
        calibrate(&mut prepared, &sample, CALIBRATION_PASSES).unwrap();
        (model, convert(prepared, mode).unwrap(), sample)
    }

    #[test]
    fn test_weights_are_per_channel_int8() {
        let (model, quantized, _) = quantized(QuantMode::Explicit);
        for view in model.weighted_layers() {
            let layer = quantized.layer(&view.name).unwrap();
            assert_eq!(layer.weight_scales.len(), view.rows, "{}", view.name);
            assert_eq!(layer.qweight.len(), view.weight.len(), "{}", view.name);
            assert_eq!(layer.weight_qmax, 127);
            assert_eq!(layer.input_qmax, 127);
            assert!(layer.input_scale > 0.0);

            // Every row reaches the end of the int8 range at its max-magnitude weight.
            for row in layer.qweight.chunks(view.cols) {
                let peak = row.iter().map(|q| q.unsigned_abs()).max().unwrap();
                assert!(peak == 127 || peak == 0, "{}", view.name);
            }
        }
    }

    #[test]
    fn test_per_tensor_weights_share_one_scale() {
        let model = small_model(9);
        let qconfig = QConfig::per_tensor_weight_int8();
        assert_eq!(qconfig.weight.qscheme, QScheme::PerTensorSymmetric);
        let mut prepared = prepare(model.clone(), &QConfigMap::global(qconfig)).unwrap();
        calibrate(&mut prepared, &Tensor::randn(vec![1, 3, 32, 32], 10), CALIBRATION_PASSES).unwrap();
        let quantized = convert(prepared, QuantMode::Explicit).unwrap();

        for view in model.weighted_layers() {
            let layer = quantized.layer(&view.name).unwrap();
            assert_eq!(layer.weight_scales.len(), view.rows, "{}", view.name);
            let amax = view.weight.iter().fold(0.0f32, |acc, w| acc.max(w.abs()));
            for &scale in &layer.weight_scales {
                assert!((scale - amax / 127.0).abs() < 1e-9, "{}", view.name);
            }

            // Only the tensor-wide maximum is guaranteed to land on the int8 limit.
            let peaks: Vec<u8> = layer
                .qweight
                .chunks(view.cols)
                .map(|row| row.iter().map(|q| q.unsigned_abs()).max().unwrap())
                .collect();
            assert_eq!(peaks.iter().max(), Some(&127), "{}", view.name);
        }

        // Per-channel conversion of the same model scales every row separately.
        let (_, per_channel, _) = self::quantized(QuantMode::Explicit);
        let stem = per_channel.layer("stem").unwrap();
        assert!(stem.weight_scales.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn test_per_channel_activations_are_rejected() {
        let mut qconfig = QConfig::explicit_int8();
        qconfig.activation.qscheme = QScheme::PerChannelSymmetric;
        assert!(matches!(
            prepare(small_model(1), &QConfigMap::global(qconfig)),
            Err(QuantizationError::InvalidObserver { .. })
        ));

        let mut qconfig = QConfig::explicit_int8();
        qconfig.weight.kind = ObserverKind::Histogram { bins: 16 };
        assert!(matches!(
            prepare(small_model(1), &QConfigMap::global(qconfig)),
            Err(QuantizationError::InvalidObserver { .. })
        ));
    }

    #[test]
    fn test_summary_lists_every_quantized_layer() {
        let (model, quantized, _) = quantized(QuantMode::Implicit);
        let summary = quantized.to_string();
        let lines: Vec<&str> = summary.lines().collect();

        assert!(lines[0].starts_with("Implicit int8"), "{}", lines[0]);
        assert!(lines[0].contains("10 calibration passes"));
        assert_eq!(lines.len(), 1 + quantized.layers().len());
        for view in model.weighted_layers() {
            let line = lines
                .iter()
                .find(|line| line.trim_start().starts_with(&format!("{}:", view.name)))
                .unwrap();
            assert!(line.contains("(qmax 63)"), "{}", line);
            assert!(line.ends_with(&format!("{} weight channels", view.rows)), "{}", line);
        }
    }

    #[test]
    fn test_implicit_mode_uses_reduced_activation_range() {
        let (_, quantized, _) = quantized(QuantMode::Implicit);
        let stem = quantized.layer("stem").unwrap();
        assert_eq!(stem.input_qmax, 63);
        assert!((stem.dynamic_range() - stem.input_scale * 63.0).abs() < DELTA);
        assert_eq!(quantized.mode(), QuantMode::Implicit);
    }

    #[test]
    fn test_quantized_forward_tracks_float_forward() {
        let (model, quantized, sample) = quantized(QuantMode::Explicit);
        let reference = model.forward(&sample).unwrap();
        let output = quantized.forward(&sample).unwrap();

        assert_eq!(output.shape(), reference.shape());
        let diff = reference.max_abs_diff(&output).unwrap();
        assert!(
            diff <= 0.1 + 0.25 * reference.max_abs(),
            "quantized output drifted by {}",
            diff
        );
    }

    #[test]
    fn test_conversion_leaves_the_input_model_intact() {
        let model = small_model(9);
        let pristine = model.clone();
        let mut prepared = prepare(model.clone(), &QConfigMap::global(QConfig::explicit_int8())).unwrap();
        calibrate(&mut prepared, &Tensor::randn(vec![1, 3, 32, 32], 1), 1).unwrap();
        let _ = convert(prepared, QuantMode::Explicit).unwrap();
        assert_eq!(model, pristine);
    }
}
