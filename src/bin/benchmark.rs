//! Main benchmark CLI executable.

use std::env;

use log::error;
use sparse_quant_bench::benchmarks::{BenchmarkResult, BenchmarkRunner, DEFAULT_CONFIG_PATH};

fn main() {
    env_logger::init();

    if let Err(e) = run_benchmarks() {
        error!("Benchmark execution failed: {}", e);
        std::process::exit(1);
    }
}

fn run_benchmarks() -> BenchmarkResult<()> {
    let args: Vec<String> = env::args().collect();

    match args.len() {
        1 => BenchmarkRunner::run_from_config(DEFAULT_CONFIG_PATH, None),
        2 => match args[1].as_str() {
            "--list" => BenchmarkRunner::list_variants(DEFAULT_CONFIG_PATH),
            "--help" | "-h" => {
                print_usage();
                Ok(())
            }
            variant => BenchmarkRunner::run_from_config(DEFAULT_CONFIG_PATH, Some(variant)),
        },
        3 if args[1] == "--config" => BenchmarkRunner::run_from_config(&args[2], None),
        4 if args[1] == "--config" && args[3] == "--list" => BenchmarkRunner::list_variants(&args[2]),
        4 if args[1] == "--config" => BenchmarkRunner::run_from_config(&args[2], Some(&args[3])),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  cargo run --bin benchmark --release                              # Run every variant");
    println!("  cargo run --bin benchmark --release -- --list                    # List variants");
    println!("  cargo run --bin benchmark --release -- \"engine int8\"             # Run one variant");
    println!("  cargo run --bin benchmark --release -- --config <path> [variant|--list]");
    println!();
    println!("The default configuration is read from {}.", DEFAULT_CONFIG_PATH);
}
