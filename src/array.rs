//! Unbounded indexable storage over linked fixed-size blocks
//!
//! [`ContinuousArray`] lets a work-stealing deque address its slots by a
//! monotonically increasing 64-bit index as if the backing array were
//! infinite. Storage is a doubly linked chain of fixed-size blocks: the owner
//! thread extends the chain on the head side as its push index grows, while
//! stealing threads read from the tail side and unlink blocks that the steal
//! index has moved past. Unlinked blocks sit on a retire list until the owner
//! deems reclamation safe and moves them to a private reuse list, so in
//! steady state the chain recycles a bounded working set of blocks.
//!
//! The access asymmetry is part of the contract, not just an optimization:
//! `put_head`, `get_head` and `reclaim_retired` touch owner-private state and
//! must only ever be called by the single owner thread, while `get_tail` may
//! be called by any number of threads. The deque layer on top enforces this
//! split with its handle types.

use crate::pool::PoolAllocator;
use crossbeam::utils::CachePadded;
use std::{
    cell::UnsafeCell,
    mem,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

/// Base-2 logarithm of the number of slots per block
pub const BLOCK_SHIFT: u32 = 14;

/// Number of slots per block
pub const BLOCK_SLOTS: usize = 1 << BLOCK_SHIFT;

/// Mask extracting the in-block offset from a logical index
const BLOCK_MASK: u64 = BLOCK_SLOTS as u64 - 1;

/// Block header, padded to a full cache-line multiple so that the slot array
/// behind it starts on its own cache line
#[repr(C, align(128))]
struct BlockHeader<T> {
    /// Neighbor with the next smaller id while the block is on the main
    /// chain. Off the chain, this link threads the retire list (written by
    /// stealing threads) or the owner's reuse list instead.
    prev: AtomicPtr<Block<T>>,

    /// Neighbor with the next larger id; null at the head of the chain
    next: AtomicPtr<Block<T>>,

    /// Unique, monotonically increasing block id, assigned at link time and
    /// immutable from publication until the block is reused
    ///
    /// Block `k` owns logical indices `[k * BLOCK_SLOTS, (k+1) * BLOCK_SLOTS)`.
    id: u64,
}

/// One fixed-size storage block
#[repr(C, align(128))]
struct Block<T> {
    header: BlockHeader<T>,
    slots: [AtomicPtr<T>; BLOCK_SLOTS],
}

/// State only the owner thread may touch
struct OwnerState<T> {
    /// Block with the largest id currently linked
    head: *mut Block<T>,

    /// Block the owner currently reads and writes; always on the main chain,
    /// and never more than one step away from the index the owner uses next
    cursor: *mut Block<T>,

    /// Reclaimed blocks available for re-linking, chained through `prev`
    reuse: *mut Block<T>,

    /// Id the next linked block will receive
    next_id: u64,
}

/// Unbounded array of pointer slots addressed by a 64-bit logical index
///
/// `T` is the pointee of the stored task pointers; the slots themselves hold
/// `*mut T` and the array never dereferences or drops them.
pub struct ContinuousArray<T> {
    /// Owner-private chain state; see the module docs for the access contract
    owner: UnsafeCell<OwnerState<T>>,

    /// Block with the smallest id still considered live, shared with stealers
    tail: CachePadded<AtomicPtr<Block<T>>>,

    /// LIFO of blocks unlinked from the tail side, awaiting reclamation,
    /// chained through `prev`
    retired: CachePadded<AtomicPtr<Block<T>>>,

    /// Source of block storage
    pool: Arc<PoolAllocator>,
}
//
// SAFETY: The array stores raw task pointers and moving them across threads
//         is its purpose, hence the T: Send bound. The owner-private state
//         behind the UnsafeCell is protected by the caller contracts of the
//         owner-only methods; everything else is atomics.
unsafe impl<T: Send> Send for ContinuousArray<T> {}
//
// SAFETY: See the Send impl above.
unsafe impl<T: Send> Sync for ContinuousArray<T> {}
//
impl<T> ContinuousArray<T> {
    /// Set up an array whose blocks come from (and return to) `pool`
    pub fn new(pool: Arc<PoolAllocator>) -> Self {
        let first = alloc_block::<T>(&pool);
        // SAFETY: alloc_block returns zeroed storage with exclusive access;
        //         the first block starts with id 0 and no neighbors.
        unsafe {
            (*first).header.id = 0;
        }
        Self {
            owner: UnsafeCell::new(OwnerState {
                head: first,
                cursor: first,
                reuse: ptr::null_mut(),
                next_id: 1,
            }),
            tail: CachePadded::new(AtomicPtr::new(first)),
            retired: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            pool,
        }
    }

    /// Store `value` at logical index `index`
    ///
    /// Grows the chain by one block when `index` is the first slot of a block
    /// that does not exist yet. The store itself is relaxed: the caller's
    /// subsequent release of its bottom index is what publishes the slot.
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this, and `index` must equal the
    /// owner's current push position (indices are written in monotone append
    /// order, modulo re-writes of positions popped back).
    pub unsafe fn put_head(&self, index: u64, value: *mut T) {
        let (id, offset) = split(index);
        let owner = &mut *self.owner.get();
        if offset == 0 {
            if id == owner.next_id {
                self.grow(owner);
            }
            if (*owner.cursor).header.id != id {
                owner.cursor = (*owner.cursor).header.next.load(Ordering::Relaxed);
            }
        }
        debug_assert!(!owner.cursor.is_null());
        debug_assert_eq!((*owner.cursor).header.id, id);
        (*owner.cursor).slots[offset].store(value, Ordering::Relaxed);
    }

    /// Load the slot at logical index `index` from the owner side
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this. `index` must have been written by
    /// a previous `put_head` and must not lie in a retired block, and the
    /// owner must only ever step one index at a time between calls (the
    /// cursor follows one block per call).
    pub unsafe fn get_head(&self, index: u64) -> *mut T {
        let (id, offset) = split(index);
        let owner = &mut *self.owner.get();
        if (*owner.cursor).header.id != id {
            // Bottom pops step back a single index, so one block is as far
            // as the cursor can be off.
            owner.cursor = (*owner.cursor).header.prev.load(Ordering::Relaxed);
        }
        debug_assert!(!owner.cursor.is_null());
        debug_assert_eq!((*owner.cursor).header.id, id);
        (*owner.cursor).slots[offset].load(Ordering::Relaxed)
    }

    /// Load the slot at logical index `index` from the stealer side
    ///
    /// Any thread may call this. As a side effect, the first access to a
    /// block beyond the tail unlinks the old tail block and pushes it onto
    /// the retire list.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `index` via its steal protocol: `index`
    /// was at or above the steal position and strictly below the published
    /// push position when the claim committed, and no reclamation of retired
    /// blocks may run concurrently with this call.
    pub unsafe fn get_tail(&self, index: u64) -> *mut T {
        let (id, offset) = split(index);
        let tail = self.tail.load(Ordering::Acquire);
        let mut block = tail;
        // Walk forward from the tail snapshot toward larger ids. Acquire
        // pairs with the release in grow() so the header fields of blocks
        // published after our snapshot are visible.
        while !block.is_null() && (*block).header.id < id {
            block = (*block).header.next.load(Ordering::Acquire);
        }
        // The tail can advance underneath us after our claim committed, in
        // which case the block we want has been unlinked into the retire
        // list; it is still reachable backwards from the snapshot.
        while !block.is_null() && (*block).header.id > id {
            block = (*block).header.prev.load(Ordering::Acquire);
        }
        debug_assert!(!block.is_null());
        debug_assert_eq!((*block).header.id, id);

        if offset == 0 && block != tail && (*tail).header.id + 1 == id {
            // We crossed into the block right after the tail, so the tail
            // block's indices can never be accessed again.
            self.retire_tail();
        }

        (*block).slots[offset].load(Ordering::Relaxed)
    }

    /// Move every retired block to the owner's reuse list
    ///
    /// Nothing is returned to the pool; a long-running owner recycles its
    /// own working set, which is bounded by the peak push/steal distance.
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this, and the caller must guarantee
    /// that no stealer is still inside [`Self::get_tail`] with a tail
    /// snapshot taken before the blocks were retired (quiescence, epochs or
    /// hazard pointers; this type does not provide the protection itself).
    pub unsafe fn reclaim_retired(&self) {
        let owner = &mut *self.owner.get();
        let mut block = self.retired.swap(ptr::null_mut(), Ordering::Acquire);
        while !block.is_null() {
            let next = (*block).header.prev.load(Ordering::Relaxed);
            (*block).header.prev.store(owner.reuse, Ordering::Relaxed);
            owner.reuse = block;
            block = next;
        }
    }

    /// Link one more block at the head of the chain
    ///
    /// # Safety
    ///
    /// Owner only; `owner` must be the state behind `self.owner`.
    unsafe fn grow(&self, owner: &mut OwnerState<T>) {
        let block = match owner.reuse {
            reused if !reused.is_null() => {
                owner.reuse = (*reused).header.prev.load(Ordering::Relaxed);
                reused
            }
            _ => alloc_block::<T>(&self.pool),
        };
        (*block).header.prev.store(owner.head, Ordering::Relaxed);
        (*block).header.next.store(ptr::null_mut(), Ordering::Relaxed);
        (*block).header.id = owner.next_id;
        owner.next_id += 1;
        // Publish: stealers walking forward acquire this store, which makes
        // the header writes above visible to them.
        (*owner.head).header.next.store(block, Ordering::Release);
        owner.head = block;
    }

    /// Swing the tail one block forward and queue the old tail block on the
    /// retire list
    ///
    /// # Safety
    ///
    /// Must only be called from `get_tail` when the old tail block can no
    /// longer be accessed (the caller claimed the first index of the block
    /// after it).
    unsafe fn retire_tail(&self) {
        let old = self.tail.load(Ordering::Relaxed);
        let next = (*old).header.next.load(Ordering::Acquire);
        debug_assert!(!next.is_null());
        if self
            .tail
            .compare_exchange(old, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // A competing stealer swung the tail past our snapshot first and
            // queued the old block along the way; nothing left to do.
            return;
        }
        debug_assert!((*self.tail.load(Ordering::Relaxed)).header.id > (*old).header.id);

        // The block is off the main chain now, so its `prev` is free to
        // thread the retire list.
        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            (*old).header.prev.store(head, Ordering::Relaxed);
            match self
                .retired
                .compare_exchange(head, old, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Hand a block's storage back to the pool
    unsafe fn free_block(&self, block: *mut Block<T>) {
        self.pool.deallocate(
            NonNull::new_unchecked(block.cast::<u8>()),
            mem::size_of::<Block<T>>(),
        );
    }
}
//
impl<T> Drop for ContinuousArray<T> {
    /// Free every block: main chain, retire list and reuse list
    ///
    /// Not concurrent; by the time the array drops, no handle that could
    /// reach it remains.
    fn drop(&mut self) {
        let (head, reuse) = {
            let owner = self.owner.get_mut();
            (owner.head, owner.reuse)
        };
        let retired = self.retired.swap(ptr::null_mut(), Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        // The tail block's backward link still points at a block that was
        // retired when the tail moved; overwrite it (with null when the
        // retire list is empty) so the walk below visits every block exactly
        // once: head .. tail, then the retire list.
        // SAFETY: Exclusive access; tail is always a valid block.
        unsafe { (*tail).header.prev.store(retired, Ordering::Relaxed) };

        for list in [head, reuse] {
            let mut block = list;
            while !block.is_null() {
                // SAFETY: Blocks on these lists are owned by the array and
                //         each one is visited exactly once.
                let prev = unsafe { (*block).header.prev.load(Ordering::Relaxed) };
                // SAFETY: The block came from this array's pool with this
                //         exact size.
                unsafe { self.free_block(block) };
                block = prev;
            }
        }
    }
}

/// Split a logical index into (block id, in-block offset)
fn split(index: u64) -> (u64, usize) {
    (index >> BLOCK_SHIFT, (index & BLOCK_MASK) as usize)
}

/// Allocate zeroed block storage from the pool
///
/// Zeroing matters: storage fresh from the system may be uninitialized, and
/// the header and every slot must hold valid values (null pointers) before
/// the block can be shared with stealers.
fn alloc_block<T>(pool: &PoolAllocator) -> *mut Block<T> {
    let bytes = pool.allocate(mem::size_of::<Block<T>>());
    let block = bytes.as_ptr().cast::<Block<T>>();
    // SAFETY: The allocation spans size_of::<Block<T>> bytes and is aligned
    //         to the pool's 128-byte guarantee, which covers Block's.
    unsafe { ptr::write_bytes(block.cast::<u8>(), 0, mem::size_of::<Block<T>>()) };
    log::trace!("continuous array: allocated a fresh block");
    block
}
