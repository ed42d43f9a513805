//! Shared driver plumbing
//!
//! The workload and benchmark binaries both time individual operations,
//! derive the row context (timestamp, thread id, address, identifier) and
//! hand it to the logger. Block sizes for the randomized workloads come from
//! a small deterministic PCG generator so runs are reproducible from a seed.

use std::io;
use std::thread;

use crate::buddy::BuddyPool;
use crate::logger::{local_timestamp, DataLogger, Operation};

/// Minimal PCG-32 generator.
///
/// Deterministic per seed; streams across threads are decorrelated by
/// offsetting the seed with the thread index.
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    const MULTIPLIER: u64 = 6364136223846793005;

    pub fn new(seed: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (seed << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(Self::MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform value in `[lo, hi]`.
    pub fn range_usize(&mut self, lo: usize, hi: usize) -> usize {
        debug_assert!(lo <= hi);
        lo + (self.next_u32() as usize) % (hi - lo + 1)
    }
}

/// Stringified identifier of the calling thread.
pub fn thread_id_string() -> String {
    format!("{:?}", thread::current().id())
}

/// Emit one event row for an operation that just completed.
///
/// `elapsed` is the operation's wall-clock seconds; fragmentation is sampled
/// from the pool at emission time.
#[allow(clippy::too_many_arguments)]
pub fn record_operation(
    logger: &DataLogger,
    pool: &BuddyPool,
    operation: Operation,
    block_size: usize,
    elapsed: f64,
    ptr: *const u8,
    allocation_id: &str,
    source: &str,
    call_stack: &str,
) -> io::Result<()> {
    logger.log(
        &local_timestamp(),
        operation,
        block_size,
        elapsed,
        pool.fragmentation(),
        source,
        call_stack,
        &BuddyPool::memory_address_of(ptr),
        &thread_id_string(),
        allocation_id,
    )
}
