//! Thin CLI driver over the `xvmalloc` library: allocates a sliding
//! window of randomly-sized blocks and reports pool occupancy.
//!
//! Corresponds to the original C `test.c` harness's `test_alloc` loop,
//! generalized to a configurable block-size range and live-set size.
use std::collections::VecDeque;
use std::process::ExitCode;

use clap::Parser;
use rand::Rng;

use xvmalloc::{Handle, Pool, XV_MAX_ALLOC_SIZE, XV_MIN_ALLOC_SIZE};

#[derive(Parser, Debug)]
#[clap(name = "xvbench", about = "Stress-drive a xvmalloc pool with randomly sized allocations")]
struct BenchConfig {
    /// Smallest payload size to allocate, in bytes.
    #[clap(long, default_value_t = XV_MIN_ALLOC_SIZE)]
    min_size: usize,

    /// Largest payload size to allocate, in bytes.
    #[clap(long, default_value_t = 256)]
    max_size: usize,

    /// Number of alloc/free cycles to run.
    #[clap(long, default_value_t = 100_000)]
    iterations: usize,

    /// Number of allocations kept live at once (the sliding window).
    #[clap(long, default_value_t = 64)]
    live: usize,

    /// Zero each block's payload right after allocating it.
    #[clap(long)]
    clear: bool,
}

fn main() -> ExitCode {
    env_logger_init();
    let config = BenchConfig::parse();

    if config.min_size == 0 || config.max_size > XV_MAX_ALLOC_SIZE || config.min_size > config.max_size {
        eprintln!(
            "invalid size range: min_size={} max_size={} (allowed 1..={})",
            config.min_size, config.max_size, XV_MAX_ALLOC_SIZE
        );
        return ExitCode::FAILURE;
    }

    let mut pool = match Pool::create_pool() {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("failed to create pool: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut rng = rand::thread_rng();
    let mut live: VecDeque<(Handle, usize)> = VecDeque::with_capacity(config.live);

    for i in 0..config.iterations {
        let size = rng.gen_range(config.min_size..=config.max_size);
        let handle = match pool.alloc(size) {
            Ok(h) => h,
            Err(err) => {
                eprintln!("alloc failed at iteration {}: {}", i, err);
                return ExitCode::FAILURE;
            }
        };

        if config.clear {
            pool.clear(handle, size);
        }

        live.push_back((handle, size));
        if live.len() > config.live {
            if let Some((h, _)) = live.pop_front() {
                pool.free(h);
            }
        }
    }

    while let Some((h, _)) = live.pop_front() {
        pool.free(h);
    }

    let stats = pool.stats();
    println!("iterations:       {}", config.iterations);
    println!("alloc calls:      {}", stats.alloc_calls.load(std::sync::atomic::Ordering::Relaxed));
    println!("free calls:       {}", stats.free_calls.load(std::sync::atomic::Ordering::Relaxed));
    println!("splits:           {}", stats.splits.load(std::sync::atomic::Ordering::Relaxed));
    println!("coalesces:        {}", stats.coalesces.load(std::sync::atomic::Ordering::Relaxed));
    println!("pages acquired:   {}", stats.pages_acquired.load(std::sync::atomic::Ordering::Relaxed));
    println!("pages released:   {}", stats.pages_released.load(std::sync::atomic::Ordering::Relaxed));
    println!("pages in use:     {}", stats.pages_in_use.current());
    println!("bytes live (peak):{}", stats.bytes_allocated.peak());

    ExitCode::SUCCESS
}

fn env_logger_init() {
    let _ = env_logger::try_init();
}
