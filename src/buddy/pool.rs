//! The buddy pool
//!
//! [`BuddyPool`] owns one contiguous zero-initialized arena of
//! `1 << max_order` bytes and serves allocations by splitting free blocks
//! down to the required order, merging buddies back on release. Blocks are
//! addressed by their byte offset inside the arena; the buddy of a block is
//! found by XOR-ing the order bit into its offset, so no block ever stores a
//! pointer to its buddy.
//!
//! A single mutex guards the engine state (free lists, free byte total,
//! timing totals). Operation counters and the allocation sequence are
//! atomics; sequence values are taken inside the critical section so their
//! order matches the lock order.

use core::ptr::NonNull;
use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use super::block::{buddy_offset, BlockHeader, HEADER_SIZE, INVALID_ALLOCATION_INDEX, PAYLOAD_ALIGN};
use super::free_list::FreeList;
use super::stats::{log_alloc_failure, BuddyStats};
use crate::{is_aligned, AllocError, AllocResult, ByteAllocator};

/// Largest accepted `max_order`; a 1 GiB arena is already past any sensible
/// benchmarking configuration.
pub const MAX_ORDER_CEILING: usize = 30;

/// Engine state guarded by the pool mutex.
#[derive(Debug)]
struct PoolInner {
    /// One list per order, indexed by order directly; slots below
    /// `min_order` stay empty.
    free_lists: Vec<FreeList>,
    /// Sum of `1 << order` over all free blocks.
    total_free: usize,
    alloc_time: Duration,
    dealloc_time: Duration,
}

/// A buddy allocator over a single contiguous arena.
#[derive(Debug)]
pub struct BuddyPool {
    base: NonNull<u8>,
    layout: Layout,
    min_order: usize,
    max_order: usize,
    pool_size: usize,
    inner: Mutex<PoolInner>,
    /// Monotonic source of allocation identifiers. Stamped under the lock.
    alloc_seq: AtomicUsize,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
}

// Raw block pointers are reached only through `inner`; the atomics carry the
// rest. See the concurrency notes in the crate docs.
unsafe impl Send for BuddyPool {}
unsafe impl Sync for BuddyPool {}

impl BuddyPool {
    /// Create a pool spanning `1 << max_order` bytes with `1 << min_order`
    /// as the smallest block size (header included).
    ///
    /// The whole arena starts as a single free block of `max_order`.
    pub fn new(min_order: usize, max_order: usize) -> AllocResult<Self> {
        if min_order >= max_order || max_order > MAX_ORDER_CEILING {
            return Err(AllocError::InvalidParam);
        }
        if (1usize << min_order) < HEADER_SIZE {
            return Err(AllocError::InvalidParam);
        }

        let pool_size = 1usize << max_order;
        let layout = Layout::from_size_align(pool_size, PAYLOAD_ALIGN)
            .map_err(|_| AllocError::InvalidParam)?;
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(AllocError::NoMemory)?;

        let mut free_lists = Vec::with_capacity(max_order + 1);
        free_lists.resize_with(max_order + 1, FreeList::new);

        let root = base.as_ptr() as *mut BlockHeader;
        unsafe {
            BlockHeader::init_free(root, max_order);
            free_lists[max_order].push_front(root);
        }

        Ok(Self {
            base,
            layout,
            min_order,
            max_order,
            pool_size,
            inner: Mutex::new(PoolInner {
                free_lists,
                total_free: pool_size,
                alloc_time: Duration::ZERO,
                dealloc_time: Duration::ZERO,
            }),
            alloc_seq: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
        })
    }

    pub fn min_order(&self) -> usize {
        self.min_order
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Arena size in bytes.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate at least `size` usable bytes.
    ///
    /// A zero-byte request is served as one byte. Returns
    /// [`AllocError::NoMemory`] when the request plus header cannot fit in
    /// any free block; nothing is mutated on that path.
    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let start = Instant::now();
        let mut inner = self.inner.lock();

        let size = if size == 0 { 1 } else { size };
        let required = match self.size_to_order(size + HEADER_SIZE) {
            Some(order) => order,
            None => {
                log_alloc_failure(&self.stats_locked(&inner), size, None);
                return Err(AllocError::NoMemory);
            }
        };

        for order in required..=self.max_order {
            if inner.free_lists[order].is_empty() {
                continue;
            }
            let Some(header) = inner.free_lists[order].pop_front() else {
                continue;
            };

            // Split down to the required order. The original block keeps its
            // offset; each step spawns the upper half as the new buddy.
            unsafe {
                while (*header).order > required {
                    let child_order = (*header).order - 1;
                    (*header).order = child_order;

                    let buddy = self.header_at(self.offset_of(header) + (1 << child_order));
                    BlockHeader::init_free(buddy, child_order);
                    inner.free_lists[child_order].push_front(buddy);
                }

                (*header).free = false;
                (*header).allocation_index = self.alloc_seq.fetch_add(1, Ordering::Relaxed);
                inner.total_free -= 1 << (*header).order;
            }

            self.total_allocations.fetch_add(1, Ordering::Relaxed);
            inner.alloc_time += start.elapsed();

            let payload = unsafe { (header as *mut u8).add(HEADER_SIZE) };
            debug_assert!(is_aligned(payload as usize, PAYLOAD_ALIGN));
            return Ok(unsafe { NonNull::new_unchecked(payload) });
        }

        log_alloc_failure(&self.stats_locked(&inner), size, Some(required));
        Err(AllocError::NoMemory)
    }

    /// Release a pointer previously returned by [`BuddyPool::allocate`].
    ///
    /// Null is a no-op. Pointers outside the arena are silently ignored so a
    /// caller mixing allocators cannot corrupt the pool.
    pub fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let start = Instant::now();
        let mut inner = self.inner.lock();

        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base + HEADER_SIZE || addr >= base + self.pool_size {
            warn!("deallocate: pointer {:#x} outside arena, ignoring", addr);
            return;
        }

        let mut header = (addr - HEADER_SIZE) as *mut BlockHeader;
        unsafe {
            (*header).free = true;
            (*header).allocation_index = INVALID_ALLOCATION_INDEX;
            inner.total_free += 1 << (*header).order;
        }
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);

        header = self.merge(&mut inner, header);
        unsafe {
            let order = (*header).order;
            inner.free_lists[order].push_front(header);
        }

        inner.dealloc_time += start.elapsed();
    }

    /// Coalesce `header` upward while its buddy sits in the matching free
    /// list. The survivor is always the lower-offset half.
    fn merge(&self, inner: &mut PoolInner, mut header: *mut BlockHeader) -> *mut BlockHeader {
        unsafe {
            let mut order = (*header).order;
            while order < self.max_order {
                let offset = self.offset_of(header);
                let buddy = self.header_at(buddy_offset(offset, order));

                // Absent from the list means the buddy is live or currently
                // carved into smaller blocks; stop merging either way.
                if !inner.free_lists[order].remove(buddy) {
                    break;
                }

                if (buddy as usize) < (header as usize) {
                    header = buddy;
                }
                order += 1;
                (*header).order = order;
                (*header).allocation_index = INVALID_ALLOCATION_INDEX;
            }
            header
        }
    }

    /// Smallest order in `[min_order, max_order]` whose block covers `size`
    /// bytes, or `None` when even the max-order block is too small.
    fn size_to_order(&self, size: usize) -> Option<usize> {
        let mut order = self.min_order;
        let mut block_size = 1usize << order;
        while block_size < size {
            if order == self.max_order {
                return None;
            }
            order += 1;
            block_size <<= 1;
        }
        Some(order)
    }

    /// Textual identifier of the live block owning `ptr`, e.g. `"Alloc42"`.
    ///
    /// `None` for null, out-of-arena or freed blocks.
    pub fn allocation_id_for(&self, ptr: *const u8) -> Option<String> {
        if ptr.is_null() {
            return None;
        }

        let _guard = self.inner.lock();

        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base + HEADER_SIZE || addr >= base + self.pool_size {
            return None;
        }

        let header = (addr - HEADER_SIZE) as *const BlockHeader;
        let index = unsafe { (*header).allocation_index };
        if index == INVALID_ALLOCATION_INDEX {
            return None;
        }
        Some(format!("Alloc{index}"))
    }

    /// Hexadecimal form of a raw address. Pure formatting, no lookup.
    pub fn memory_address_of(ptr: *const u8) -> String {
        format!("{ptr:p}")
    }

    /// Cumulative successful allocations.
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }

    /// Cumulative deallocations, out-of-arena no-ops excluded.
    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations.load(Ordering::Relaxed)
    }

    /// Total wall-clock seconds spent in [`BuddyPool::allocate`], lock waits
    /// included.
    pub fn allocation_time_total(&self) -> f64 {
        self.inner.lock().alloc_time.as_secs_f64()
    }

    /// Total wall-clock seconds spent in [`BuddyPool::deallocate`].
    pub fn deallocation_time_total(&self) -> f64 {
        self.inner.lock().dealloc_time.as_secs_f64()
    }

    /// Free fraction of the pool in `[0, 1]`; `1.0` when fully idle.
    pub fn fragmentation(&self) -> f64 {
        self.inner.lock().total_free as f64 / self.pool_size as f64
    }

    /// Snapshot of the free-list state.
    pub fn stats(&self) -> BuddyStats {
        self.stats_locked(&self.inner.lock())
    }

    fn stats_locked(&self, inner: &PoolInner) -> BuddyStats {
        BuddyStats {
            pool_bytes: self.pool_size,
            free_bytes: inner.total_free,
            used_bytes: self.pool_size - inner.total_free,
            free_blocks_by_order: inner.free_lists.iter().map(FreeList::len).collect(),
        }
    }

    fn offset_of(&self, header: *const BlockHeader) -> usize {
        header as usize - self.base.as_ptr() as usize
    }

    fn header_at(&self, offset: usize) -> *mut BlockHeader {
        debug_assert!(offset < self.pool_size);
        unsafe { self.base.as_ptr().add(offset) as *mut BlockHeader }
    }
}

impl Drop for BuddyPool {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl ByteAllocator for BuddyPool {
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        BuddyPool::allocate(self, size)
    }

    fn deallocate(&self, ptr: *mut u8) {
        BuddyPool::deallocate(self, ptr)
    }

    fn total_bytes(&self) -> usize {
        self.pool_size
    }

    fn used_bytes(&self) -> usize {
        self.pool_size - self.inner.lock().total_free
    }

    fn available_bytes(&self) -> usize {
        self.inner.lock().total_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_starts_with_single_root_block() {
        let pool = BuddyPool::new(6, 14).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.pool_bytes, 1 << 14);
        assert_eq!(stats.free_bytes, 1 << 14);
        assert_eq!(stats.free_blocks_by_order[14], 1);
        assert_eq!(stats.free_block_count(), 1);
    }

    #[test]
    fn test_new_rejects_bad_orders() {
        assert_eq!(BuddyPool::new(10, 10).unwrap_err(), AllocError::InvalidParam);
        assert_eq!(BuddyPool::new(12, 8).unwrap_err(), AllocError::InvalidParam);
        assert_eq!(
            BuddyPool::new(6, MAX_ORDER_CEILING + 1).unwrap_err(),
            AllocError::InvalidParam
        );
    }

    #[test]
    fn test_size_to_order_rounds_up() {
        let pool = BuddyPool::new(6, 14).unwrap();
        assert_eq!(pool.size_to_order(1), Some(6));
        assert_eq!(pool.size_to_order(64), Some(6));
        assert_eq!(pool.size_to_order(65), Some(7));
        assert_eq!(pool.size_to_order(1 << 14), Some(14));
        assert_eq!(pool.size_to_order((1 << 14) + 1), None);
    }

    #[test]
    fn test_allocate_splits_to_required_order() {
        let pool = BuddyPool::new(6, 14).unwrap();
        let ptr = pool.allocate(64).unwrap();

        // 64 + header needs an order-7 block; every larger order now holds
        // exactly one split remainder.
        let stats = pool.stats();
        for order in 7..14 {
            assert_eq!(stats.free_blocks_by_order[order], 1, "order {order}");
        }
        assert_eq!(stats.free_bytes, (1 << 14) - (1 << 7));

        pool.deallocate(ptr.as_ptr());
    }

    #[test]
    fn test_deallocate_merges_back_to_root() {
        let pool = BuddyPool::new(6, 14).unwrap();
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(64).unwrap();

        pool.deallocate(a.as_ptr());
        pool.deallocate(b.as_ptr());

        let stats = pool.stats();
        assert_eq!(stats.free_bytes, 1 << 14);
        assert_eq!(stats.free_blocks_by_order[14], 1);
        assert_eq!(stats.free_block_count(), 1);
    }

    #[test]
    fn test_unsatisfiable_request_mutates_nothing() {
        let pool = BuddyPool::new(6, 12).unwrap();
        let before = pool.stats();

        assert_eq!(pool.allocate(1 << 13).unwrap_err(), AllocError::NoMemory);
        // A request equal to the pool size cannot fit once the header is added.
        assert_eq!(pool.allocate(1 << 12).unwrap_err(), AllocError::NoMemory);

        assert_eq!(pool.stats(), before);
        assert_eq!(pool.total_allocations(), 0);
        assert_eq!(pool.allocation_time_total(), 0.0);
    }

    #[test]
    fn test_zero_size_allocation_is_live() {
        let pool = BuddyPool::new(6, 14).unwrap();
        let ptr = pool.allocate(0).unwrap();
        assert!(pool.allocation_id_for(ptr.as_ptr()).is_some());
        pool.deallocate(ptr.as_ptr());
        assert_eq!(pool.fragmentation(), 1.0);
    }

    #[test]
    fn test_allocation_ids_are_sequential() {
        let pool = BuddyPool::new(6, 14).unwrap();
        let a = pool.allocate(32).unwrap();
        let b = pool.allocate(32).unwrap();
        assert_eq!(pool.allocation_id_for(a.as_ptr()).unwrap(), "Alloc0");
        assert_eq!(pool.allocation_id_for(b.as_ptr()).unwrap(), "Alloc1");

        pool.deallocate(a.as_ptr());
        assert_eq!(pool.allocation_id_for(a.as_ptr()), None);
        pool.deallocate(b.as_ptr());
    }

    #[test]
    fn test_out_of_arena_pointers_ignored() {
        let pool = BuddyPool::new(6, 12).unwrap();
        let mut outside = 0u8;

        pool.deallocate(&mut outside);
        pool.deallocate(core::ptr::null_mut());

        assert_eq!(pool.total_deallocations(), 0);
        assert_eq!(pool.fragmentation(), 1.0);
        assert_eq!(pool.allocation_id_for(&outside), None);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let pool = BuddyPool::new(6, 10).unwrap();
        let mut ptrs = Vec::new();
        while let Ok(ptr) = pool.allocate(64) {
            ptrs.push(ptr);
        }
        // 1 KiB pool, order-7 blocks (64 bytes + header): eight of them.
        assert_eq!(ptrs.len(), (1 << 10) / (1 << 7));

        for ptr in ptrs.drain(..) {
            pool.deallocate(ptr.as_ptr());
        }
        assert_eq!(pool.fragmentation(), 1.0);
        assert!(pool.allocate(64).is_ok());
    }

    #[test]
    fn test_byte_allocator_accounting() {
        let pool = BuddyPool::new(6, 14).unwrap();
        assert_eq!(pool.total_bytes(), 1 << 14);
        assert_eq!(pool.available_bytes(), 1 << 14);

        let ptr = ByteAllocator::allocate(&pool, 200).unwrap();
        // 200 + header rounds to an order-8 block.
        assert_eq!(pool.used_bytes(), 1 << 8);
        assert_eq!(pool.available_bytes(), (1 << 14) - (1 << 8));

        ByteAllocator::deallocate(&pool, ptr.as_ptr());
        assert_eq!(pool.used_bytes(), 0);
    }
}
