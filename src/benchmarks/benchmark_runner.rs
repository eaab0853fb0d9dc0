//! Core benchmark execution logic.

use std::fs;
use std::sync::Arc;

use log::{info, warn};

use super::benchmark_errors::{BenchmarkError, BenchmarkResult, WithLabel};
use super::benchmark_types::{BenchConfig, TimingSample, VariantConfig};
use super::performance_metrics::{print_performance_analysis, time_callable};
use crate::engine::{
    BuildFlags, BuilderLogLevel, BuilderSettings, EngineBuilder, EngineModule, InputTensorSpec,
};
use crate::model::Network;
use crate::quantization::{QConfig, QConfigMap, QuantMode, calibrate, convert, prepare};
use crate::runtime::{DeviceContext, Forward, HostContext};
use crate::sparsity::post_training_sparsify;
use crate::tensor::Tensor;
use crate::tracer::trace;

/// Default location of the benchmark configuration.
pub const DEFAULT_CONFIG_PATH: &str = "configs/benchmark.json";

/// Labels of the baseline timings.
pub const BASELINE_DEVICE_LABEL: &str = "baseline (device)";
pub const BASELINE_HOST_LABEL: &str = "baseline (host)";

/// Configuration loader that handles JSON files with fallbacks
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a configuration file with fallback to defaults
    pub fn load_config<T>(path: &str, config_name: &str) -> BenchmarkResult<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        match fs::read_to_string(path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| BenchmarkError::ConfigParseError {
                    path: path.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                warn!(
                    "Config file '{}' not found, using default configuration for {}",
                    path, config_name
                );
                Ok(T::default())
            }
        }
    }

    /// Load and validate the benchmark configuration
    pub fn load_bench_config(path: &str) -> BenchmarkResult<BenchConfig> {
        let config: BenchConfig = Self::load_config(path, "benchmark")?;
        config.validate()?;
        Ok(config)
    }
}

/// A compiled variant ready to be timed.
#[derive(Debug, Clone)]
pub struct BuiltVariant {
    pub label: String,
    pub module: Arc<EngineModule>,
    /// Max absolute difference between the quantized reference model and the
    /// engine on the calibration sample.
    pub quant_diff: Option<f32>,
}

/// Main benchmark runner
pub struct BenchmarkRunner;

impl BenchmarkRunner {
    /// Builds the baseline: the checkpoint when configured, else a seeded network.
    pub fn baseline(config: &BenchConfig) -> BenchmarkResult<Network> {
        let network = match &config.checkpoint {
            Some(path) => {
                info!("Loading baseline checkpoint from {}", path.display());
                Network::load(path)?
            }
            None => Network::resnet_like(config.arch.clone(), config.seed)?,
        };
        Ok(network)
    }

    /// Sample used for tracing, calibration and the accuracy spot-check.
    pub fn sample_input(config: &BenchConfig) -> Tensor {
        Tensor::randn(config.input_dims(1), config.seed.wrapping_add(1))
    }

    /// Runs the build pipeline of one variant on a private copy of `baseline`:
    /// sparsify, quantize (prepare, calibrate, convert), trace, build.
    pub fn build_variant(
        baseline: &Network,
        variant: &VariantConfig,
        config: &BenchConfig,
    ) -> BenchmarkResult<BuiltVariant> {
        variant.validate()?;
        let label = variant.label();
        info!("Building {}", label);

        let mut model = baseline.clone();
        if variant.sparsify {
            post_training_sparsify(&mut model, Some(config.sparsity), true).with_label(&label)?;
        }

        let sample = Self::sample_input(config);
        let settings = BuilderSettings {
            log_level: BuilderLogLevel::Info,
            ..BuilderSettings::default()
        };
        let flags = BuildFlags {
            sparse_weight: variant.sparsify,
            ..BuildFlags::default()
        };

        let (graph, specs, settings, flags, reference) = match variant.quant_mode {
            None => {
                let graph = trace(&model, &sample).with_label(&label)?;
                let specs = vec![InputTensorSpec::item(&config.input_shape)];
                let flags = BuildFlags {
                    fp16_mode: true,
                    ..flags
                };
                (graph, specs, settings, flags, None)
            }
            Some(mode) => {
                let qconfig = match mode {
                    QuantMode::Explicit => QConfig::explicit_int8(),
                    QuantMode::Implicit => QConfig::implicit_int8(),
                };
                let mut prepared = prepare(model, &QConfigMap::global(qconfig)).with_label(&label)?;
                calibrate(&mut prepared, &sample, config.calibration_passes).with_label(&label)?;
                let quantized = convert(prepared, mode).with_label(&label)?;
                info!("Quantized model: {}", quantized);
                let reference = quantized
                    .forward(&sample)
                    .map_err(|source| BenchmarkError::Quantization {
                        variant: label.clone(),
                        source: source.into(),
                    })?;
                let graph = trace(&quantized, &sample).with_label(&label)?;

                let flags = BuildFlags {
                    int8_mode: true,
                    ..flags
                };
                match mode {
                    QuantMode::Explicit => {
                        let [min, opt, max] = config.explicit_batch_range;
                        let specs = vec![InputTensorSpec::dynamic_batch(&config.input_shape, min, opt, max)];
                        let settings = BuilderSettings {
                            explicit_batch_dimension: true,
                            explicit_precision: true,
                            ..settings
                        };
                        (graph, specs, settings, flags, Some((mode, reference)))
                    }
                    QuantMode::Implicit => {
                        let specs = InputTensorSpec::from_tensors(&[&sample]);
                        let flags = BuildFlags {
                            strict_type_constraints: true,
                            ..flags
                        };
                        (graph, specs, settings, flags, Some((mode, reference)))
                    }
                }
            }
        };

        let result = EngineBuilder::new(graph, specs, settings)
            .run(flags)
            .with_label(&label)?;
        let module = EngineModule::new(result).with_label(&label)?;

        let quant_diff = match reference {
            Some((mode, reference)) => {
                let output = module.forward(&sample).with_label(&label)?;
                let diff = reference
                    .max_abs_diff(&output)
                    .ok_or_else(|| BenchmarkError::OutputMismatch {
                        label: label.clone(),
                        expected: reference.shape().to_vec(),
                        actual: output.shape().to_vec(),
                    })?;
                let mode = match mode {
                    QuantMode::Explicit => "explicit",
                    QuantMode::Implicit => "implicit",
                };
                println!("{} quant result diff max {}", mode, diff);
                if !variant.tolerance().allows(diff, reference.max_abs()) {
                    warn!("{} deviates from its quantized reference by {}", label, diff);
                }
                Some(diff)
            }
            None => None,
        };

        Ok(BuiltVariant {
            label,
            module: Arc::new(module),
            quant_diff,
        })
    }

    /// Builds every variant in order, then times each engine on the device
    /// context followed by the baseline on the device and on the host.
    ///
    /// The first failure aborts the run.
    pub fn run(
        baseline: &Network,
        variants: &[VariantConfig],
        config: &BenchConfig,
    ) -> BenchmarkResult<Vec<TimingSample>> {
        let built = variants
            .iter()
            .map(|variant| Self::build_variant(baseline, variant, config))
            .collect::<BenchmarkResult<Vec<_>>>()?;

        let input = Arc::new(Tensor::randn(
            config.input_dims(config.batch_size),
            config.seed.wrapping_add(2),
        ));
        let device = DeviceContext::new("device").with_label("device")?;

        let mut samples = Vec::with_capacity(built.len() + 2);
        for variant in &built {
            let callable: Arc<dyn Forward> = variant.module.clone();
            samples.push(time_callable(
                &variant.label,
                &device,
                config.iterations,
                callable,
                Arc::clone(&input),
            )?);
        }

        let reference: Arc<dyn Forward> = Arc::new(baseline.clone());
        samples.push(time_callable(
            BASELINE_DEVICE_LABEL,
            &device,
            config.iterations,
            Arc::clone(&reference),
            Arc::clone(&input),
        )?);
        samples.push(time_callable(
            BASELINE_HOST_LABEL,
            &HostContext,
            config.iterations,
            reference,
            input,
        )?);
        Ok(samples)
    }

    /// Loads the configuration at `path` and runs either every configured
    /// variant or only the one labelled `only`.
    pub fn run_from_config(path: &str, only: Option<&str>) -> BenchmarkResult<()> {
        let config = ConfigLoader::load_bench_config(path)?;
        let variants: Vec<VariantConfig> = match only {
            Some(label) => {
                let variant = config
                    .variants
                    .iter()
                    .find(|v| v.label() == label)
                    .copied()
                    .ok_or_else(|| BenchmarkError::UnknownVariant {
                        label: label.to_string(),
                    })?;
                vec![variant]
            }
            None => config.variants.clone(),
        };

        info!("{}", "=".repeat(80));
        info!("Sparse/quantized inference benchmark");
        info!(
            "Input: {:?}, {} iterations, {} variants",
            config.input_dims(config.batch_size),
            config.iterations,
            variants.len()
        );
        info!("{}", "=".repeat(80));

        let baseline = Self::baseline(&config)?;
        let samples = Self::run(&baseline, &variants, &config)?;
        print_performance_analysis(&samples, BASELINE_DEVICE_LABEL);
        Ok(())
    }

    /// List the variants of the configuration at `path`
    pub fn list_variants(path: &str) -> BenchmarkResult<()> {
        let config = ConfigLoader::load_bench_config(path)?;
        println!("Available variants:");
        for variant in &config.variants {
            println!("  {}", variant.label());
        }
        Ok(())
    }
}
