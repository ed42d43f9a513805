//! Workload driver
//!
//! Exercises the buddy pool with sequential, random or mixed
//! allocate/deallocate patterns and writes one CSV row per operation.
//! `--threads N` runs the selected workload concurrently on scoped threads.

use std::error::Error;
use std::fs;
use std::process;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use buddy_trace_allocator::logger::file_timestamp;
use buddy_trace_allocator::workload::{record_operation, Pcg32};
use buddy_trace_allocator::{Args, BuddyPool, DataLogger, Operation, Settings};

/// Mixed-workload size distribution, cycled per operation.
const MIXED_SIZES: &[usize] = &[32, 64, 128, 256, 512, 1024];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Args = argh::from_env();
    if let Err(err) = run(&args) {
        eprintln!("workloads: {err}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let settings = Settings::resolve(args)?;
    let test = settings.test.as_deref().unwrap_or("sequential");

    let pool = BuddyPool::new(settings.min_order, settings.max_order)?;

    fs::create_dir_all(&settings.out)?;
    let path = format!("{}/workloads_{}.csv", settings.out, file_timestamp());
    let logger = DataLogger::create(&path)?;

    info!(
        test,
        ops = settings.ops,
        threads = settings.threads,
        "starting workload against a {} byte pool",
        pool.pool_size()
    );

    run_across_threads(&pool, &logger, &settings, |pool, logger, seed| {
        let ops = settings.ops / settings.threads;
        match test {
            "sequential" => sequential(pool, logger, settings.block_size, ops),
            "random" => random(
                pool,
                logger,
                settings.min_block_size,
                settings.max_block_size,
                ops,
                seed,
            ),
            "mixed" => mixed(pool, logger, ops),
            other => Err(format!("invalid test type {other:?} (expected sequential, random or mixed)").into()),
        }
    })?;

    info!(
        allocations = pool.total_allocations(),
        deallocations = pool.total_deallocations(),
        fragmentation = pool.fragmentation(),
        "workload finished, events written to {path}"
    );
    Ok(())
}

type WorkloadResult = Result<(), Box<dyn Error>>;

/// Run `body` once on this thread, or fan it out over scoped threads when
/// more than one is configured. Each thread gets a decorrelated seed.
fn run_across_threads<F>(
    pool: &BuddyPool,
    logger: &DataLogger,
    settings: &Settings,
    body: F,
) -> WorkloadResult
where
    F: Fn(&BuddyPool, &DataLogger, u64) -> WorkloadResult + Sync,
{
    if settings.threads == 1 {
        return body(pool, logger, settings.seed);
    }

    let mut failed = false;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..settings.threads)
            .map(|index| {
                let body = &body;
                let seed = settings.seed.wrapping_add(index as u64);
                scope.spawn(move || body(pool, logger, seed).is_ok())
            })
            .collect();
        for handle in handles {
            if !matches!(handle.join(), Ok(true)) {
                failed = true;
            }
        }
    });

    if failed {
        return Err("one or more workload threads failed".into());
    }
    Ok(())
}

/// Allocate `ops` fixed-size blocks, then release them in the same order.
fn sequential(pool: &BuddyPool, logger: &DataLogger, block_size: usize, ops: usize) -> WorkloadResult {
    let mut live = Vec::with_capacity(ops);

    for i in 0..ops {
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
            "sequential",
            "workloads::sequential",
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
            "sequential",
            "workloads::sequential",
        )?;
    }

    Ok(())
}

/// Allocate `ops` blocks with sizes drawn uniformly from
/// `[min_size, max_size]`, then release them all.
fn random(
    pool: &BuddyPool,
    logger: &DataLogger,
    min_size: usize,
    max_size: usize,
    ops: usize,
    seed: u64,
) -> WorkloadResult {
    let mut rng = Pcg32::new(seed);
    let mut live = Vec::with_capacity(ops);

    for i in 0..ops {
        let block_size = rng.range_usize(min_size, max_size);

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
            "random",
            "workloads::random",
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
            "random",
            "workloads::random",
        )?;
    }

    Ok(())
}

/// Cycle through the mixed size distribution to simulate a real caller mix.
fn mixed(pool: &BuddyPool, logger: &DataLogger, ops: usize) -> WorkloadResult {
    let mut live = Vec::with_capacity(ops);

    for i in 0..ops {
        let block_size = MIXED_SIZES[i % MIXED_SIZES.len()];

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
            "mixed",
            "workloads::mixed",
        )?;
        live.push((ptr, block_size, id));
    }

    // Release in reverse to touch the coalescing path from the far end.
    for (ptr, block_size, id) in live.into_iter().rev() {
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
            "mixed",
            "workloads::mixed",
        )?;
    }

    Ok(())
}
