//! Benchmark type definitions and configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::benchmark_errors::{BenchmarkError, BenchmarkResult};
use crate::engine::BuilderSettings;
use crate::model::ArchConfig;
use crate::quantization::{CALIBRATION_PASSES, QuantMode};
use crate::sparsity::SparsityConfig;

/// Compute precision of an engine variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp16,
    Int8,
}

/// Allowed deviation of an engine output from the baseline:
/// `max |engine - baseline| <= abs + rel * max |baseline|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f32,
    pub rel: f32,
}

impl Tolerance {
    pub fn allows(&self, max_diff: f32, reference_max_abs: f32) -> bool {
        max_diff <= self.abs + self.rel * reference_max_abs
    }
}

/// One engine build configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantConfig {
    pub precision: Precision,
    #[serde(default)]
    pub sparsify: bool,
    #[serde(default)]
    pub quant_mode: Option<QuantMode>,
}

impl VariantConfig {
    pub fn builder() -> VariantConfigBuilder {
        VariantConfigBuilder::default()
    }

    /// The six variants in benchmark order.
    pub fn standard_suite() -> Vec<VariantConfig> {
        let fp16 = VariantConfig {
            precision: Precision::Fp16,
            sparsify: false,
            quant_mode: None,
        };
        let int8 = |sparsify, mode| VariantConfig {
            precision: Precision::Int8,
            sparsify,
            quant_mode: Some(mode),
        };
        vec![
            fp16,
            VariantConfig { sparsify: true, ..fp16 },
            int8(false, QuantMode::Explicit),
            int8(true, QuantMode::Explicit),
            int8(false, QuantMode::Implicit),
            int8(true, QuantMode::Implicit),
        ]
    }

    pub fn label(&self) -> String {
        let sparse = if self.sparsify { "sparse " } else { "" };
        match (self.precision, self.quant_mode) {
            (Precision::Int8, Some(QuantMode::Implicit)) => format!("engine implicit {}int8", sparse),
            (Precision::Int8, _) => format!("engine {}int8", sparse),
            (Precision::Fp16, _) => format!("engine {}fp16", sparse),
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        match self.precision {
            Precision::Fp16 => Tolerance { abs: 1e-2, rel: 1e-2 },
            Precision::Int8 => Tolerance { abs: 0.1, rel: 0.25 },
        }
    }

    pub fn validate(&self) -> BenchmarkResult<()> {
        match (self.precision, self.quant_mode) {
            (Precision::Int8, None) => Err(BenchmarkError::InvalidVariant {
                message: "int8 variants need a quantization mode".to_string(),
            }),
            (Precision::Fp16, Some(_)) => Err(BenchmarkError::InvalidVariant {
                message: "fp16 variants are not quantized".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VariantConfigBuilder {
    precision: Option<Precision>,
    sparsify: bool,
    quant_mode: Option<QuantMode>,
}

impl VariantConfigBuilder {
    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn sparsify(mut self, sparsify: bool) -> Self {
        self.sparsify = sparsify;
        self
    }

    pub fn quant_mode(mut self, mode: QuantMode) -> Self {
        self.quant_mode = Some(mode);
        self
    }

    pub fn build(self) -> BenchmarkResult<VariantConfig> {
        let precision = self.precision.ok_or_else(|| BenchmarkError::InvalidVariant {
            message: "precision is required".to_string(),
        })?;
        let variant = VariantConfig {
            precision,
            sparsify: self.sparsify,
            quant_mode: self.quant_mode,
        };
        variant.validate()?;
        Ok(variant)
    }
}

/// Benchmark configuration, loaded from `configs/benchmark.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub iterations: usize,
    pub batch_size: usize,
    /// Input shape of one item, `[C, H, W]`.
    pub input_shape: Vec<usize>,
    pub calibration_passes: usize,
    pub seed: u64,
    /// `[min, opt, max]` batch sizes of explicitly quantized engines.
    pub explicit_batch_range: [usize; 3],
    pub arch: ArchConfig,
    pub sparsity: SparsityConfig,
    pub variants: Vec<VariantConfig>,
    /// Baseline weights; a seeded network is built when absent.
    pub checkpoint: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            batch_size: 5,
            input_shape: vec![3, 224, 224],
            calibration_passes: CALIBRATION_PASSES,
            seed: 0,
            explicit_batch_range: [1, 5, 10],
            arch: ArchConfig::default(),
            sparsity: SparsityConfig::default(),
            variants: VariantConfig::standard_suite(),
            checkpoint: None,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> BenchmarkResult<()> {
        let invalid = |field: &str, message: String| BenchmarkError::ConfigValidationError {
            field: field.to_string(),
            message,
        };

        if self.iterations == 0 {
            return Err(BenchmarkError::InvalidIterations {
                value: self.iterations,
            });
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be greater than 0".to_string()));
        }
        if self.input_shape.len() != 3 || self.input_shape.contains(&0) {
            return Err(invalid(
                "input_shape",
                format!("expected positive [C, H, W], got {:?}", self.input_shape),
            ));
        }
        if self.input_shape[0] != self.arch.input_channels {
            return Err(invalid(
                "input_shape",
                format!(
                    "{} channels, but the network takes {}",
                    self.input_shape[0], self.arch.input_channels
                ),
            ));
        }
        if self.calibration_passes == 0 {
            return Err(invalid("calibration_passes", "must be greater than 0".to_string()));
        }

        let [min, opt, max] = self.explicit_batch_range;
        if min == 0 || min > opt || opt > max {
            return Err(invalid(
                "explicit_batch_range",
                format!("expected 0 < min <= opt <= max, got {:?}", self.explicit_batch_range),
            ));
        }
        let explicit = self
            .variants
            .iter()
            .any(|v| v.quant_mode == Some(QuantMode::Explicit));
        if explicit && !(min..=max).contains(&self.batch_size) {
            return Err(invalid(
                "batch_size",
                format!("{} is outside the explicit batch range {}..={}", self.batch_size, min, max),
            ));
        }

        let implicit_max = BuilderSettings::default().max_batch_size;
        if self.batch_size > implicit_max {
            return Err(invalid(
                "batch_size",
                format!("{} exceeds the engine max batch size {}", self.batch_size, implicit_max),
            ));
        }

        if self.variants.is_empty() {
            return Err(invalid("variants", "at least one variant is required".to_string()));
        }
        for variant in &self.variants {
            variant.validate()?;
        }

        self.arch
            .validate()
            .map_err(|e| invalid("arch", e.to_string()))?;
        self.sparsity
            .validate()
            .map_err(|e| invalid("sparsity", e.to_string()))?;
        Ok(())
    }

    /// `[batch, C, H, W]`.
    pub fn input_dims(&self, batch: usize) -> Vec<usize> {
        let mut dims = vec![batch];
        dims.extend_from_slice(&self.input_shape);
        dims
    }
}

/// Timing of one callable.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSample {
    pub label: String,
    pub total_time_ns: u128,
    pub mean_ms: f64,
    pub iterations: usize,
}

impl TimingSample {
    pub fn new(label: String, elapsed: Duration, iterations: usize) -> Self {
        Self {
            label,
            total_time_ns: elapsed.as_nanos(),
            mean_ms: elapsed.as_secs_f64() / iterations as f64 * 1000.0,
            iterations,
        }
    }

    /// How many times faster than `baseline` this sample ran.
    pub fn speedup_vs(&self, baseline: &TimingSample) -> f64 {
        baseline.mean_ms / self.mean_ms
    }
}
