// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run example pipelines.
//!
//! Run with `RUST_LOG=debug` and `--features log` to see the pipeline
//! lifecycle, or `--features log_blocks` to trace every block.

use blockpipe::{CpuPinningPolicy, PipelineBuilder, ShutdownPolicy, ThreadCount};
use clap::{Parser, ValueEnum};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::collections::HashSet;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let builder = PipelineBuilder {
        block_size: cli.block_size,
        thread_count: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        queue_capacity: cli.queue_capacity,
        shutdown: match cli.shutdown {
            ShutdownCli::Drain => ShutdownPolicy::Drain,
            ShutdownCli::Cancel => ShutdownPolicy::Cancel,
        },
        shutdown_grace: Duration::from_millis(cli.grace_ms),
        cpu_pinning: CpuPinningPolicy::IfSupported,
        ..PipelineBuilder::default()
    };

    let failures = sample_indices(cli.input_size, cli.failures, 42);
    let drops = sample_indices(cli.input_size, cli.drops, 43);
    let work = cli.work;
    let transform = move |x: u64| {
        if failures.contains(&x) {
            return Err(format!("item {x} is marked as failing"));
        }
        if drops.contains(&x) {
            return Ok(None);
        }
        Ok(Some(busy_work(x, work)))
    };

    let start = Instant::now();
    let mut results = match builder
        .build(0..cli.input_size, transform)
        .and_then(|pipeline| pipeline.start())
    {
        Ok(results) => results,
        Err(e) => {
            eprintln!("failed to start the pipeline: {e}");
            std::process::exit(1);
        }
    };

    let abort = results.abort_handle();
    let mut count = 0usize;
    let mut checksum = 0u64;
    for result in results.by_ref() {
        match result {
            Ok(x) => {
                count += 1;
                checksum = checksum.wrapping_add(x);
                if cli.abort_after.is_some_and(|limit| count >= limit) {
                    abort.abort();
                }
            }
            Err(e) => {
                eprintln!("pipeline failed: {e}");
                break;
            }
        }
    }
    if let Err(e) = results.release() {
        eprintln!("failed to release the pipeline: {e}");
    }

    println!(
        "processed {count} item(s) in {:?}, checksum = {}",
        start.elapsed(),
        black_box(checksum)
    );
}

/// Spins on the input for the given number of rounds, to simulate an
/// expensive transform.
fn busy_work(x: u64, rounds: u32) -> u64 {
    let mut acc = x;
    for _ in 0..rounds {
        acc = black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407));
    }
    acc
}

/// Picks `density` distinct indices below `input_size`. The set of indices
/// follows a uniform distribution, but is fixed by the seed for
/// reproducibility.
fn sample_indices(input_size: u64, density: usize, seed: u64) -> HashSet<u64> {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    let input_size = input_size as usize;
    index::sample(&mut rng, input_size, density.min(input_size))
        .into_iter()
        .map(|i| i as u64)
        .collect()
}

/// CLI tool to run example pipelines.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Total number of threads, including the producer. Default to the
    /// available parallelism plus one.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Number of items per block.
    #[arg(long, default_value_t = 1000)]
    block_size: usize,

    /// Number of blocks that each channel can hold.
    #[arg(long, default_value_t = 100)]
    queue_capacity: usize,

    /// Handling of in-flight blocks on abort.
    #[arg(long, value_enum, default_value_t = ShutdownCli::Drain)]
    shutdown: ShutdownCli,

    /// Grace period for the threads to terminate, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    grace_ms: u64,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Number of rounds of busy work per item.
    #[arg(long, default_value_t = 100)]
    work: u32,

    /// Number of items whose transform fails.
    #[arg(long, default_value_t = 0)]
    failures: usize,

    /// Number of items that the transform drops.
    #[arg(long, default_value_t = 0)]
    drops: usize,

    /// Abort the pipeline after receiving this many results.
    #[arg(long)]
    abort_after: Option<usize>,
}

/// Handling of in-flight blocks on abort.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownCli {
    /// Workers finish the block they hold.
    Drain,
    /// Workers stop between two items.
    Cancel,
}
