//! Size-classed pool for fixed-size storage blocks
//!
//! The pool hands out headerless, 128-byte-aligned blocks from a vector of
//! size classes given at construction. Classes below [`LARGE_THRESHOLD`] are
//! served from per-thread free-list shards so that the common path never
//! contends with other threads; classes at or above it share one lock-free
//! free stack each. Requests larger than the largest class fall through to
//! the aligned system allocator and are not pooled.
//!
//! Running out of memory is fatal: a work-stealing runtime has no recoverable
//! path once task storage cannot grow, so failed system allocations go
//! through [`std::alloc::handle_alloc_error`].

use crossbeam::{epoch, utils::CachePadded};
use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
};

/// Maximum alignment guaranteed by the pool
///
/// Every pointer returned by [`PoolAllocator::allocate`] is aligned to this
/// many bytes, and every class stride is rounded up to a multiple of it.
pub const MAX_ALIGNMENT: usize = 128;

/// Size classes at or above this many bytes share one free stack per class;
/// smaller classes get per-thread free-list shards.
const LARGE_THRESHOLD: usize = 1 << 18;

/// Target byte size of the chunks that refill small-class free lists
const CHUNK_BYTES: usize = 1 << 16;

/// Number of free-list shards per small class
///
/// Threads are spread over the shards by a process-wide slot counter, so two
/// threads only share a shard (and its lock) once more than this many threads
/// have touched the pool.
const SMALL_SHARDS: usize = 32;

/// Pool of headerless storage blocks in caller-chosen size classes
///
/// Class sizes must be at least 8 bytes and strictly increasing. The pool is
/// shared: `allocate` and `deallocate` may be called from any thread.
pub struct PoolAllocator {
    /// Logical class sizes, as given at construction
    sizes: Box<[usize]>,

    /// Number of leading classes below [`LARGE_THRESHOLD`]
    num_small: usize,

    /// Largest small class size, 0 when every class is large
    max_small: usize,

    /// Largest class size; bigger requests bypass the pool
    max_size: usize,

    /// One shard set per small class
    small_classes: Box<[SmallClass]>,

    /// One shared free stack per large class
    large_classes: Box<[LargeClass]>,

    /// Bytes currently handed out from large classes and oversize requests
    large_used: AtomicUsize,

    /// Bytes currently backed by system allocations on the large path
    large_allocated: AtomicUsize,

    /// Chunk allocations backing the small-class free lists
    ///
    /// Blocks on the small free lists point into these chunks; the chunks are
    /// released wholesale when the pool is dropped.
    chunks: Mutex<Vec<(NonNull<u8>, Layout)>>,
}
//
// SAFETY: The pool hands out exclusive ownership of raw blocks. The pointers
//         it retains (free lists, chunk registry) are never dereferenced
//         while a user holds the block, and all of its shared state is
//         synchronized through locks, atomics, or the epoch-protected free
//         stacks.
unsafe impl Send for PoolAllocator {}
//
// SAFETY: See the Send impl above.
unsafe impl Sync for PoolAllocator {}
//
impl PoolAllocator {
    /// Set up a pool from a vector of class sizes
    ///
    /// # Panics
    ///
    /// Panics if `sizes` is empty, contains a class below 8 bytes, or is not
    /// strictly increasing.
    pub fn new(sizes: Vec<usize>) -> Self {
        assert!(!sizes.is_empty(), "at least one size class is required");
        let mut prev = 0;
        for &size in &sizes {
            assert!(size >= 8, "size classes must be at least 8 bytes");
            assert!(size > prev, "size classes must be strictly increasing");
            prev = size;
        }

        let num_small = sizes.iter().take_while(|&&s| s < LARGE_THRESHOLD).count();
        let max_small = if num_small > 0 { sizes[num_small - 1] } else { 0 };
        let max_size = *sizes.last().expect("sizes checked non-empty above");
        let small_classes = sizes[..num_small].iter().map(|&s| SmallClass::new(s)).collect();
        let large_classes = sizes[num_small..].iter().map(|&s| LargeClass::new(s)).collect();
        Self {
            sizes: sizes.into(),
            num_small,
            max_small,
            max_size,
            small_classes,
            large_classes,
            large_used: AtomicUsize::new(0),
            large_allocated: AtomicUsize::new(0),
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Process-wide pool used for deque block storage
    ///
    /// Power-of-two classes from 64 bytes to 2 MiB, which covers the block
    /// size of [`crate::array::ContinuousArray`] with room to spare.
    pub fn global() -> &'static Arc<PoolAllocator> {
        static GLOBAL: OnceLock<Arc<PoolAllocator>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Arc::new(PoolAllocator::new((6..=21).map(|shift| 1usize << shift).collect()))
        })
    }

    /// Allocate `n` bytes of block storage, aligned to [`MAX_ALIGNMENT`]
    pub fn allocate(&self, n: usize) -> NonNull<u8> {
        if self.num_small == 0 || n > self.max_small {
            self.allocate_large(n)
        } else {
            self.allocate_small(self.small_class_index(n))
        }
    }

    /// Return a block previously obtained from [`Self::allocate`] with the
    /// same `n`
    pub fn deallocate(&self, block: NonNull<u8>, n: usize) {
        if self.num_small == 0 || n > self.max_small {
            self.deallocate_large(block, n);
        } else {
            let class = &self.small_classes[self.small_class_index(n)];
            let shard = &class.shards[thread_slot(class.shards.len())];
            shard.lock().expect("pool shard lock poisoned").push(block);
            class.used.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Currently used bytes and bytes held in reserve for future allocations
    pub fn stats(&self) -> (usize, usize) {
        let mut used = self.large_used.load(Ordering::Relaxed);
        let mut allocated = self.large_allocated.load(Ordering::Relaxed);
        for class in self.small_classes.iter() {
            used += class.used.load(Ordering::Relaxed) * class.stride;
            allocated += class.allocated.load(Ordering::Relaxed) * class.stride;
        }
        (used, allocated.saturating_sub(used))
    }

    /// Release every block sitting on the large-class free stacks back to the
    /// system allocator
    ///
    /// Small-class storage stays reserved until the pool is dropped.
    pub fn clear(&self) {
        for class in self.large_classes.iter() {
            let layout = large_layout(class.stride);
            while let Some(block) = class.free.pop() {
                // SAFETY: Blocks on this free stack were allocated with
                //         exactly this class's layout in allocate_large().
                unsafe { alloc::dealloc(block.as_ptr(), layout) };
                self.large_allocated.fetch_sub(class.stride, Ordering::Relaxed);
            }
        }
        log::debug!("pool: released large-class free stacks to the system");
    }

    /// Index of the smallest small class that fits `n`
    fn small_class_index(&self, n: usize) -> usize {
        self.sizes[..self.num_small]
            .iter()
            .position(|&size| n <= size)
            .expect("callers checked n against max_small")
    }

    /// Index (into `large_classes`) of the smallest large class that fits `n`
    fn large_class_index(&self, n: usize) -> usize {
        self.sizes[self.num_small..]
            .iter()
            .position(|&size| n <= size)
            .expect("callers checked n against max_size")
    }

    fn allocate_small(&self, class_idx: usize) -> NonNull<u8> {
        let class = &self.small_classes[class_idx];
        let shard = &class.shards[thread_slot(class.shards.len())];
        let mut free = shard.lock().expect("pool shard lock poisoned");
        let block = match free.pop() {
            Some(block) => block,
            None => {
                self.refill(class, &mut free);
                free.pop().expect("refill always carves at least one block")
            }
        };
        class.used.fetch_add(1, Ordering::Relaxed);
        block
    }

    /// Carve a fresh chunk of blocks into a small class's free list
    fn refill(&self, class: &SmallClass, free: &mut Vec<NonNull<u8>>) {
        let count = (CHUNK_BYTES / class.stride).max(4);
        let layout = Layout::from_size_align(count * class.stride, MAX_ALIGNMENT)
            .expect("chunk layout cannot overflow for validated class sizes");
        // SAFETY: The layout has non-zero size.
        let chunk = unsafe { alloc::alloc(layout) };
        let Some(chunk) = NonNull::new(chunk) else {
            alloc::handle_alloc_error(layout)
        };
        log::trace!(
            "pool: carved {count} blocks of {} bytes for a small class",
            class.stride
        );
        for i in 0..count {
            // SAFETY: i * stride stays within the chunk allocation.
            free.push(unsafe { NonNull::new_unchecked(chunk.as_ptr().add(i * class.stride)) });
        }
        class.allocated.fetch_add(count, Ordering::Relaxed);
        self.chunks
            .lock()
            .expect("pool chunk registry lock poisoned")
            .push((chunk, layout));
    }

    fn allocate_large(&self, n: usize) -> NonNull<u8> {
        self.large_used.fetch_add(n, Ordering::Relaxed);
        let alloc_size = if n <= self.max_size {
            let class = &self.large_classes[self.large_class_index(n)];
            if let Some(block) = class.free.pop() {
                return block;
            }
            class.stride
        } else {
            // Oversize requests bypass the pool entirely.
            n.next_multiple_of(MAX_ALIGNMENT)
        };
        let layout = large_layout(alloc_size);
        // SAFETY: The layout has non-zero size (classes are at least 8 bytes
        //         and oversize requests exceed max_size).
        let block = unsafe { alloc::alloc(layout) };
        let Some(block) = NonNull::new(block) else {
            alloc::handle_alloc_error(layout)
        };
        self.large_allocated.fetch_add(alloc_size, Ordering::Relaxed);
        block
    }

    fn deallocate_large(&self, block: NonNull<u8>, n: usize) {
        self.large_used.fetch_sub(n, Ordering::Relaxed);
        if n > self.max_size {
            let alloc_size = n.next_multiple_of(MAX_ALIGNMENT);
            // SAFETY: Oversize blocks were allocated with exactly this layout
            //         in allocate_large().
            unsafe { alloc::dealloc(block.as_ptr(), large_layout(alloc_size)) };
            self.large_allocated.fetch_sub(alloc_size, Ordering::Relaxed);
        } else {
            // Large-class blocks are kept for reuse until clear().
            self.large_classes[self.large_class_index(n)].free.push(block);
        }
    }
}
//
impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.clear();
        let chunks = self.chunks.get_mut().expect("pool chunk registry lock poisoned");
        for (chunk, layout) in chunks.drain(..) {
            // SAFETY: The registry records the exact layout each chunk was
            //         allocated with, and dropping the pool invalidates every
            //         block handed out from it per the API contract.
            unsafe { alloc::dealloc(chunk.as_ptr(), layout) };
        }
    }
}

/// Per-thread free-list shards for one small size class
struct SmallClass {
    /// Class size rounded up to a multiple of [`MAX_ALIGNMENT`]
    stride: usize,

    /// Blocks currently handed out from this class
    used: AtomicUsize,

    /// Blocks carved from chunks so far
    allocated: AtomicUsize,

    /// Free lists, one per thread slot
    shards: Box<[CachePadded<Mutex<Vec<NonNull<u8>>>>]>,
}
//
impl SmallClass {
    fn new(size: usize) -> Self {
        Self {
            stride: size.next_multiple_of(MAX_ALIGNMENT),
            used: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            shards: (0..SMALL_SHARDS)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
        }
    }
}

/// Shared free stack for one large size class
struct LargeClass {
    /// Class size rounded up to a multiple of [`MAX_ALIGNMENT`]
    stride: usize,

    /// Lock-free LIFO of recycled blocks
    free: FreeStack,
}
//
impl LargeClass {
    fn new(size: usize) -> Self {
        Self {
            stride: size.next_multiple_of(MAX_ALIGNMENT),
            free: FreeStack::new(),
        }
    }
}

/// Treiber stack of free blocks, with node reclamation handled by
/// `crossbeam::epoch` so that a popped node cannot be freed while another
/// thread still dereferences it mid-CAS
struct FreeStack {
    head: epoch::Atomic<FreeNode>,
}
//
struct FreeNode {
    block: NonNull<u8>,
    next: epoch::Atomic<FreeNode>,
}
//
impl FreeStack {
    fn new() -> Self {
        Self {
            head: epoch::Atomic::null(),
        }
    }

    fn push(&self, block: NonNull<u8>) {
        let guard = epoch::pin();
        let mut node = epoch::Owned::new(FreeNode {
            block,
            next: epoch::Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);
            node.next.store(head, Ordering::Relaxed);
            // Release so a popping thread observes the node's fields.
            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(err) => node = err.new,
            }
        }
    }

    fn pop(&self) -> Option<NonNull<u8>> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: The epoch guard keeps the node alive until unpinned,
            //         even if another thread pops and retires it first.
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Relaxed, &guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::Acquire, Ordering::Relaxed, &guard)
                .is_ok()
            {
                let block = node.block;
                // SAFETY: The CAS unlinked the node, so no new reference to
                //         it can be created; destruction is deferred past all
                //         current guards.
                unsafe { guard.defer_destroy(head) };
                return Some(block);
            }
        }
    }
}
//
impl Drop for FreeStack {
    fn drop(&mut self) {
        // SAFETY: &mut self guarantees no other thread touches the stack.
        let guard = unsafe { epoch::unprotected() };
        let mut head = self.head.load(Ordering::Relaxed, guard);
        while !head.is_null() {
            // SAFETY: Nodes on the stack stay valid until destroyed, and the
            //         exclusive access above rules out concurrent pops.
            let next = unsafe { head.as_ref() }
                .expect("null checked above")
                .next
                .load(Ordering::Relaxed, guard);
            // SAFETY: Exclusive access; each node is converted back exactly
            //         once along this walk.
            drop(unsafe { head.into_owned() });
            head = next;
        }
    }
}

/// Compact process-wide slot of the calling thread, wrapped to `count`
fn thread_slot(count: usize) -> usize {
    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
    }
    SLOT.with(|slot| slot % count)
}

/// Layout of a large-path system allocation of `alloc_size` bytes
fn large_layout(alloc_size: usize) -> Layout {
    Layout::from_size_align(alloc_size, MAX_ALIGNMENT)
        .expect("large layout cannot overflow for validated sizes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_pool() -> PoolAllocator {
        PoolAllocator::new((3..=19).map(|shift| 1usize << shift).collect())
    }

    #[test]
    #[should_panic(expected = "at least one size class")]
    fn rejects_empty_class_vector() {
        PoolAllocator::new(vec![]);
    }

    #[test]
    #[should_panic(expected = "at least 8 bytes")]
    fn rejects_tiny_classes() {
        PoolAllocator::new(vec![4, 16]);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn rejects_non_increasing_classes() {
        PoolAllocator::new(vec![16, 16]);
    }

    #[test]
    fn small_blocks_recycle() {
        let pool = test_pool();
        let first = pool.allocate(64);
        pool.deallocate(first, 64);
        // Same thread, same shard: the free list is a LIFO.
        assert_eq!(pool.allocate(64), first);
        pool.deallocate(first, 64);
    }

    #[test]
    fn large_blocks_recycle() {
        let pool = test_pool();
        let n = LARGE_THRESHOLD;
        let first = pool.allocate(n);
        pool.deallocate(first, n);
        assert_eq!(pool.allocate(n), first);
        pool.deallocate(first, n);
    }

    #[test]
    fn oversize_requests_bypass_the_pool() {
        let pool = test_pool();
        let n = pool.max_size + 1;
        let block = pool.allocate(n);
        assert_eq!(block.as_ptr() as usize % MAX_ALIGNMENT, 0);
        pool.deallocate(block, n);
        let (used, _reserved) = pool.stats();
        assert_eq!(used, 0);
    }

    #[test]
    fn stats_track_small_usage() {
        let pool = test_pool();
        assert_eq!(pool.stats(), (0, 0));

        let block = pool.allocate(64);
        let (used, reserved) = pool.stats();
        // The 64-byte class is padded to the guaranteed alignment.
        assert_eq!(used, 128);
        assert!(reserved > 0);

        pool.deallocate(block, 64);
        let (used, reserved) = pool.stats();
        assert_eq!(used, 0);
        assert!(reserved > 0);
    }

    #[test]
    fn clear_releases_large_reserves() {
        let pool = test_pool();
        let n = LARGE_THRESHOLD;
        let block = pool.allocate(n);
        pool.deallocate(block, n);
        let (_, reserved_before) = pool.stats();
        assert!(reserved_before >= n);

        pool.clear();
        let (_, reserved_after) = pool.stats();
        assert!(reserved_after < reserved_before);

        // The pool keeps working after a clear.
        let block = pool.allocate(n);
        pool.deallocate(block, n);
    }

    #[test]
    fn concurrent_alloc_dealloc() {
        let pool = test_pool();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..1_000usize {
                        let n = 8 << (i % 6);
                        let block = pool.allocate(n);
                        assert_eq!(block.as_ptr() as usize % MAX_ALIGNMENT, 0);
                        pool.deallocate(block, n);
                    }
                });
            }
        });
        let (used, _) = pool.stats();
        assert_eq!(used, 0);
    }

    proptest! {
        #[test]
        fn allocations_are_aligned(n in 1usize..=(1 << 19) + 512) {
            let pool = test_pool();
            let block = pool.allocate(n);
            prop_assert_eq!(block.as_ptr() as usize % MAX_ALIGNMENT, 0);
            pool.deallocate(block, n);
        }

        #[test]
        fn usage_returns_to_zero(sizes in prop::collection::vec(1usize..=(1 << 19), 1..16)) {
            let pool = test_pool();
            let blocks: Vec<_> = sizes.iter().map(|&n| pool.allocate(n)).collect();
            let (used, _) = pool.stats();
            prop_assert!(used > 0);
            for (block, &n) in blocks.into_iter().zip(&sizes) {
                pool.deallocate(block, n);
            }
            let (used, _) = pool.stats();
            prop_assert_eq!(used, 0);
        }
    }
}
