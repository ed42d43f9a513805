//! Statistics and debugging for the buddy pool
//!
//! Provides point-in-time snapshots of the free-list state and a failure
//! report logged when an allocation cannot be satisfied.

use log::debug;

/// Buddy pool statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyStats {
    /// Arena size in bytes (`1 << max_order`).
    pub pool_bytes: usize,
    /// Sum of `1 << order` over all free blocks.
    pub free_bytes: usize,
    /// `pool_bytes - free_bytes`.
    pub used_bytes: usize,
    /// Free block count per order; index 0 corresponds to order 0 so the
    /// entries below `min_order` stay zero.
    pub free_blocks_by_order: Vec<usize>,
}

impl BuddyStats {
    /// Total number of free blocks across all orders.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks_by_order.iter().sum()
    }
}

/// Log the per-order free block distribution after a failed allocation.
pub(crate) fn log_alloc_failure(stats: &BuddyStats, requested: usize, required_order: Option<usize>) {
    debug!(
        "allocation failure: {} bytes requested (order {:?}), {} of {} bytes free",
        requested, required_order, stats.free_bytes, stats.pool_bytes
    );
    for (order, &count) in stats.free_blocks_by_order.iter().enumerate() {
        if count > 0 {
            debug!(
                "  order {}: {} free blocks ({} bytes each)",
                order,
                count,
                1usize << order
            );
        }
    }
}
