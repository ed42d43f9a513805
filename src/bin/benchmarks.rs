//! Benchmark driver
//!
//! Measures allocator performance under fixed-size, variable-size and
//! throughput loads. Fixed and variable runs log one row per operation;
//! the throughput run additionally appends a Summary row with ops/s
//! throughput figures and the final fragmentation percentage.

use std::error::Error;
use std::fs;
use std::process;
use std::time::{Duration, Instant};

use tracing::info;
use tracing_subscriber::EnvFilter;

use buddy_trace_allocator::logger::file_timestamp;
use buddy_trace_allocator::workload::{record_operation, Pcg32};
use buddy_trace_allocator::{Args, BuddyPool, DataLogger, Operation, Settings};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Args = argh::from_env();
    if let Err(err) = run(&args) {
        eprintln!("benchmarks: {err}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let settings = Settings::resolve(args)?;
    let benchmark = settings.benchmark.as_deref().unwrap_or("fixed");

    let pool = BuddyPool::new(settings.min_order, settings.max_order)?;

    fs::create_dir_all(&settings.out)?;
    let path = format!("{}/benchmarks_{}.csv", settings.out, file_timestamp());
    let logger = DataLogger::create(&path)?;

    info!(benchmark, "starting benchmark against a {} byte pool", pool.pool_size());

    match benchmark {
        "fixed" => fixed_size(&pool, &logger, &settings)?,
        "variable" => variable_size(&pool, &logger, &settings)?,
        "throughput" => throughput(&pool, &logger, &settings)?,
        other => {
            return Err(format!(
                "invalid benchmark type {other:?} (expected fixed, variable or throughput)"
            )
            .into())
        }
    }

    info!("benchmark finished, events written to {path}");
    Ok(())
}

/// Allocate and release `ops` blocks of one size, logging each operation.
fn fixed_size(pool: &BuddyPool, logger: &DataLogger, settings: &Settings) -> Result<(), Box<dyn Error>> {
    let block_size = settings.block_size;
    let mut live = Vec::with_capacity(settings.ops);

    for i in 0..settings.ops {
        let start = Instant::now();
        let ptr = match pool.allocate(block_size) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::warn!("allocation failed at iteration {i}: {err}");
                break;
            }
        };
        let elapsed = start.elapsed().as_secs_f64();

        let id = pool.allocation_id_for(ptr.as_ptr()).unwrap_or_default();
        record_operation(
            logger,
            pool,
            Operation::Allocation,
            block_size,
            elapsed,
            ptr.as_ptr(),
            &id,
            "fixed",
            "benchmarks::fixed_size",
        )?;
        live.push((ptr, id));
    }

    for (ptr, id) in live {
        let start = Instant::now();
        pool.deallocate(ptr.as_ptr());
        let elapsed = start.elapsed().as_secs_f64();

        record_operation(
            logger,
            pool,
            Operation::Deallocation,
            block_size,
            elapsed,
            ptr.as_ptr(),
            &id,
            "fixed",
            "benchmarks::fixed_size",
        )?;
    }

    Ok(())
}

/// Allocate and release `ops` blocks with uniformly distributed sizes.
fn variable_size(
    pool: &BuddyPool,
    logger: &DataLogger,
    settings: &Settings,
) -> Result<(), Box<dyn Error>> {
    let mut rng = Pcg32::new(settings.seed);
    let mut live = Vec::with_capacity(settings.ops);

    for i in 0..settings.ops {
        let block_size = rng.range_usize(settings.min_block_size, settings.max_block_size);

        let start = Instant::now();
        let ptr = match pool.allocate(block_size) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::warn!("allocation failed at iteration {i}: {err}");
                break;
            }
        };
        let elapsed = start.elapsed().as_secs_f64();

        let id = pool.allocation_id_for(ptr.as_ptr()).unwrap_or_default();
        record_operation(
            logger,
            pool,
            Operation::Allocation,
            block_size,
            elapsed,
            ptr.as_ptr(),
            &id,
            "variable",
            "benchmarks::variable_size",
        )?;
        live.push((ptr, block_size, id));
    }

    for (ptr, block_size, id) in live {
        let start = Instant::now();
        pool.deallocate(ptr.as_ptr());
        let elapsed = start.elapsed().as_secs_f64();

        record_operation(
            logger,
            pool,
            Operation::Deallocation,
            block_size,
            elapsed,
            ptr.as_ptr(),
            &id,
            "variable",
            "benchmarks::variable_size",
        )?;
    }

    Ok(())
}

/// Alternate allocations with FIFO releases until the configured duration
/// elapses, then append a Summary row with ops/s throughput.
fn throughput(pool: &BuddyPool, logger: &DataLogger, settings: &Settings) -> Result<(), Box<dyn Error>> {
    let block_size = settings.block_size;
    let mut live = std::collections::VecDeque::new();
    let mut alloc_count = 0usize;
    let mut dealloc_count = 0usize;

    let started = Instant::now();
    let deadline = started + Duration::from_secs_f64(settings.duration);

    while Instant::now() < deadline {
        let start = Instant::now();
        let allocated = pool.allocate(block_size);
        let elapsed = start.elapsed().as_secs_f64();

        if let Ok(ptr) = allocated {
            alloc_count += 1;
            let id = pool.allocation_id_for(ptr.as_ptr()).unwrap_or_default();
            record_operation(
                logger,
                pool,
                Operation::Allocation,
                block_size,
                elapsed,
                ptr.as_ptr(),
                &id,
                "throughput",
                "benchmarks::throughput",
            )?;
            live.push_back((ptr, id));
        }

        if let Some((ptr, id)) = live.pop_front() {
            let start = Instant::now();
            pool.deallocate(ptr.as_ptr());
            let elapsed = start.elapsed().as_secs_f64();
            dealloc_count += 1;

            record_operation(
                logger,
                pool,
                Operation::Deallocation,
                block_size,
                elapsed,
                ptr.as_ptr(),
                &id,
                "throughput",
                "benchmarks::throughput",
            )?;
        }
    }

    // Drain whatever the deadline left behind.
    for (ptr, _) in live {
        pool.deallocate(ptr.as_ptr());
        dealloc_count += 1;
    }

    let actual = started.elapsed().as_secs_f64();
    let alloc_throughput = alloc_count as f64 / actual;
    let dealloc_throughput = dealloc_count as f64 / actual;

    logger.log_summary(
        "Throughput Benchmark Summary",
        alloc_throughput,
        dealloc_throughput,
        pool.fragmentation() * 100.0,
    )?;

    info!(
        duration = actual,
        allocations = alloc_count,
        deallocations = dealloc_count,
        alloc_throughput,
        dealloc_throughput,
        "throughput benchmark complete"
    );
    Ok(())
}
