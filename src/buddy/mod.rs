//! Buddy allocator module
//!
//! This module provides a complete buddy system implementation with:
//! - In-band block headers doubling as intrusive free-list nodes
//! - One free list per order with split/coalesce on power-of-two blocks
//! - Operation counters, timing totals and per-order statistics

pub mod block;
pub mod free_list;
pub mod pool;
pub mod stats;

pub use block::{BlockHeader, HEADER_SIZE, PAYLOAD_ALIGN};
pub use pool::BuddyPool;
pub use stats::BuddyStats;
