//! Performance measurement utilities for benchmarks.

use std::sync::Arc;
use std::time::Instant;

use log::info;

use super::benchmark_errors::{BenchmarkError, BenchmarkResult, WithLabel};
use super::benchmark_types::TimingSample;
use crate::runtime::{ExecutionContext, Forward};
use crate::tensor::Tensor;

/// Times `iterations` calls of `callable` on `context`.
///
/// There is no warm-up. The context is drained before the clock starts and
/// after every call, so the mean reflects completed work rather than queued
/// launches. Prints `<label> time (ms/iter) <mean>`.
pub fn time_callable(
    label: &str,
    context: &dyn ExecutionContext,
    iterations: usize,
    callable: Arc<dyn Forward>,
    input: Arc<Tensor>,
) -> BenchmarkResult<TimingSample> {
    if iterations == 0 {
        return Err(BenchmarkError::InvalidIterations { value: iterations });
    }
    info!(
        "Timing {} on '{}' ({} iterations)...",
        label,
        context.name(),
        iterations
    );

    let progress = (iterations / 10).max(1);
    context.synchronize().with_label(label)?;
    let start = Instant::now();
    for i in 0..iterations {
        let callable = Arc::clone(&callable);
        let input = Arc::clone(&input);
        context
            .launch(Box::new(move || callable.forward(&input).map(|_| ())))
            .with_label(label)?;
        context.synchronize().with_label(label)?;
        if (i + 1) % progress == 0 {
            info!("  Progress: {}/{}", i + 1, iterations);
        }
    }
    let sample = TimingSample::new(label.to_string(), start.elapsed(), iterations);

    println!("{} time (ms/iter) {}", sample.label, sample.mean_ms);
    Ok(sample)
}

/// Prints every sample with its speedup over `baseline_label`, then the ranking.
pub fn print_performance_analysis(samples: &[TimingSample], baseline_label: &str) {
    if samples.is_empty() {
        return;
    }
    let baseline = samples.iter().find(|s| s.label == baseline_label);

    println!("\n{}", "=".repeat(80));
    println!("Detailed Results");
    println!("{}", "=".repeat(80));

    for sample in samples {
        println!("\n{}", sample.label);
        println!("   Mean time: {:.3} ms/iter", sample.mean_ms);
        println!("   Total time: {:.3} ms", sample.total_time_ns as f64 / 1_000_000.0);
        println!("   Iterations: {}", sample.iterations);
        if let Some(baseline) = baseline.filter(|b| b.label != sample.label) {
            println!("   Speedup vs {}: {:.2}x", baseline.label, sample.speedup_vs(baseline));
        }
    }

    println!("\n{}", "=".repeat(80));
    println!("Speed Rankings (fastest to slowest)");
    println!("{}", "=".repeat(80));

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.mean_ms.total_cmp(&b.mean_ms));
    for (i, sample) in sorted.iter().enumerate() {
        println!("   {:>2}. {}: {:.3} ms", i + 1, sample.label, sample.mean_ms);
    }
}
