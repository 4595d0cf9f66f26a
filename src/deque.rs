//! Unbounded lock-free work-stealing deque
//!
//! One *owner* thread pushes and pops task pointers at the bottom of the
//! deque; any number of *stealer* threads take from the top. The index
//! protocol follows "Correct and Efficient Work-Stealing for Weak Memory
//! Models" by Lê, Pop, Cohen and Zappa Nardelli, while the storage follows
//! the linked-block scheme of "A Dynamic-Sized Nonblocking Work Stealing
//! Deque" by Hendler, Lev, Moir and Shavit: instead of a circular buffer the
//! deque indexes into a [`ContinuousArray`], so it never fills up and never
//! pays a copying reallocation on the hot path.
//!
//! The owner/stealer asymmetry is encoded in the handle types rather than in
//! documentation: a [`Worker`] cannot be cloned and its operations take
//! `&mut self`, so the owner-only side of the protocol is enforced by the
//! borrow checker, while [`Stealer`] handles are freely cloned and shared.
//!
//! The deque stores borrowed task pointers. It never dereferences or drops
//! the pointees; whoever pops or steals a pointer takes over whatever
//! ownership convention the surrounding scheduler uses.
//!
//! # Example
//!
//! ```
//! use magpie::Worker;
//! use std::ptr::NonNull;
//!
//! let tasks = [1u32, 2, 3];
//! let mut worker = Worker::new();
//! let stealer = worker.stealer();
//! for task in &tasks {
//!     worker.push(NonNull::from(task));
//! }
//! // Stealers see the oldest task, the owner the newest.
//! let stolen = stealer.steal();
//! assert_eq!(stolen.task.map(|t| unsafe { *t.as_ref() }), Some(1));
//! assert_eq!(worker.pop().map(|t| unsafe { *t.as_ref() }), Some(3));
//! ```

use crate::{array::ContinuousArray, pool::PoolAllocator};
use crossbeam::utils::CachePadded;
use std::{
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{fence, AtomicU64, Ordering},
        Arc,
    },
};

/// Deque state shared between the worker and its stealers
///
/// The field order matters for cache behavior: the array is read-mostly
/// once warmed up, while `bot` and `top` are written from different threads
/// and each gets its own cache line.
#[repr(C, align(128))]
struct SharedDeque<T> {
    /// Slot storage, indexed by `bot` and `top`
    array: ContinuousArray<T>,

    /// Index the owner will push into next
    bot: CachePadded<AtomicU64>,

    /// Smallest index still available to stealers
    top: CachePadded<AtomicU64>,
}

/// Owner-side handle to a work-stealing deque
///
/// There is exactly one `Worker` per deque; it cannot be cloned, and both
/// ends of the owner protocol ([`push`](Worker::push) and
/// [`pop`](Worker::pop)) take `&mut self`. Moving the handle to another
/// thread transfers the owner role wholesale.
pub struct Worker<T> {
    shared: Arc<SharedDeque<T>>,
}
//
impl<T> Worker<T> {
    /// Set up an empty deque, drawing block storage from the process-wide
    /// pool
    pub fn new() -> Self {
        Self::with_pool(PoolAllocator::global().clone())
    }

    /// Set up an empty deque with a caller-provided block pool
    pub fn with_pool(pool: Arc<PoolAllocator>) -> Self {
        Self {
            shared: Arc::new(SharedDeque {
                array: ContinuousArray::new(pool),
                bot: CachePadded::new(AtomicU64::new(0)),
                top: CachePadded::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Set up a stealer handle to this deque
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            shared: self.shared.clone(),
        }
    }

    /// Push a task onto the bottom of the deque
    ///
    /// Never fails: the backing storage grows on demand (one block
    /// allocation every [`crate::array::BLOCK_SLOTS`] pushes at worst, and
    /// usually a recycled block at that).
    pub fn push(&mut self, task: NonNull<T>) {
        let shared = &*self.shared;
        let bot = shared.bot.load(Ordering::Relaxed);
        // SAFETY: &mut self on the non-clonable Worker makes us the owner
        //         thread, and `bot` is the current push position.
        unsafe { shared.array.put_head(bot, task.as_ptr()) };
        // SeqCst: publishes the slot store above and orders the index update
        // against the full fences in pop() and steal().
        shared.bot.store(bot + 1, Ordering::SeqCst);
    }

    /// Pop the most recently pushed task still present, if any
    ///
    /// Returns `None` when the deque is empty and when a concurrent steal
    /// got the last task first.
    pub fn pop(&mut self) -> Option<NonNull<T>> {
        let shared = &*self.shared;
        let bot = shared.bot.load(Ordering::Relaxed);
        if bot == 0 {
            return None;
        }
        let bot = bot - 1;
        // Tentatively claim the slot, then synchronize with stealers: the
        // store must be globally visible before we read `top`.
        shared.bot.store(bot, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = shared.top.load(Ordering::Relaxed);

        if top > bot {
            // Empty; undo the claim so bot >= top again.
            shared.bot.store(bot + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: We are the owner thread and index `bot` was pushed
        //         earlier; top <= bot keeps it out of retired storage.
        let task = unsafe { shared.array.get_head(bot) };
        if top == bot {
            // Exactly one task left and stealers may be after it too; the
            // CAS on `top` decides who gets it.
            let won = shared
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            // Either way the deque is now empty at bot + 1 == top + 1;
            // restoring bot keeps future pushes indexing correctly.
            shared.bot.store(bot + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        debug_assert!(!task.is_null());
        NonNull::new(task)
    }

    /// Recycle every block the stealers have retired
    ///
    /// Retired blocks go back to this deque's private reuse list, keeping
    /// the steady-state block count proportional to the deque's peak length.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no stealer is inside
    /// [`Stealer::steal`] while this runs and that none will observe the
    /// recycled blocks through a stale tail snapshot; schedulers typically
    /// call this from a barrier or another known-quiescent point.
    pub unsafe fn reclaim_retired(&mut self) {
        self.shared.array.reclaim_retired();
    }
}
//
impl<T> Default for Worker<T> {
    fn default() -> Self {
        Self::new()
    }
}
//
impl<T> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("bot", &self.shared.bot.load(Ordering::Relaxed))
            .field("top", &self.shared.top.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Stealer-side handle to a work-stealing deque
///
/// Cheaply clonable; any number of threads may steal concurrently.
pub struct Stealer<T> {
    shared: Arc<SharedDeque<T>>,
}
//
impl<T> Stealer<T> {
    /// Try to steal the oldest task in the deque
    ///
    /// Besides the task (if one was won), the result carries a conservative
    /// hint that the deque just ran empty; see [`Steal::empty_hint`].
    pub fn steal(&self) -> Steal<T> {
        let shared = &*self.shared;
        let top = shared.top.load(Ordering::Acquire);
        // Order the reads of `top` and `bot` against the owner's updates.
        fence(Ordering::SeqCst);
        let bot = shared.bot.load(Ordering::Acquire);
        // bot strays at most one below top, and only transiently while the
        // owner disputes the last task.
        debug_assert!(bot + 1 >= top);

        if bot <= top {
            return Steal {
                task: None,
                empty_hint: true,
            };
        }
        let empty_hint = bot == top + 1;
        if shared
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Another thief (or the owner disputing the last task) won the
            // index; the caller decides whether to retry.
            return Steal {
                task: None,
                empty_hint,
            };
        }
        // SAFETY: The CAS claimed index `top` exclusively, and top < bot
        //         held after the fence, so the slot was published and its
        //         block is still protected from reclamation.
        let task = unsafe { shared.array.get_tail(top) };
        debug_assert!(!task.is_null());
        Steal {
            task: NonNull::new(task),
            empty_hint,
        }
    }
}
//
impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}
//
impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer")
            .field("bot", &self.shared.bot.load(Ordering::Relaxed))
            .field("top", &self.shared.top.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Outcome of one steal attempt
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Steal<T> {
    /// The stolen task, or `None` on an empty deque or a lost race
    pub task: Option<NonNull<T>>,

    /// Conservative "that was the last stealable task" signal
    ///
    /// When true, the deque looked empty (or about to be) at the time of the
    /// attempt. A concurrent push may have refilled it since, so this is a
    /// hint to stop polling this deque, not a guarantee of emptiness.
    pub empty_hint: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::BLOCK_SLOTS;
    use proptest::prelude::*;

    /// Read back a value pushed via `NonNull::from(&values[i])`
    fn value(task: NonNull<u64>) -> u64 {
        // SAFETY: Tests only push references into slices that outlive the
        //         deque operations.
        unsafe { *task.as_ref() }
    }

    #[test]
    fn pop_returns_lifo() {
        let values: Vec<u64> = (1..=5).collect();
        let mut worker = Worker::new();
        for v in &values {
            worker.push(NonNull::from(v));
        }
        let popped: Vec<u64> = std::iter::from_fn(|| worker.pop().map(value)).collect();
        assert_eq!(popped, [5, 4, 3, 2, 1]);
    }

    #[test]
    fn steal_returns_fifo() {
        let values: Vec<u64> = (1..=5).collect();
        let mut worker = Worker::new();
        let stealer = worker.stealer();
        for v in &values {
            worker.push(NonNull::from(v));
        }
        for expected in 1..=5u64 {
            let steal = stealer.steal();
            assert_eq!(steal.task.map(value), Some(expected));
            assert_eq!(steal.empty_hint, expected == 5);
        }
        let steal = stealer.steal();
        assert_eq!(steal.task, None);
        assert!(steal.empty_hint);
    }

    #[test]
    fn pop_on_empty_leaves_indices_alone() {
        let mut worker = Worker::<u64>::new();
        assert_eq!(worker.pop(), None);
        assert_eq!(worker.shared.bot.load(Ordering::Relaxed), 0);
        assert_eq!(worker.shared.top.load(Ordering::Relaxed), 0);

        // Also once bot is away from zero.
        let values: Vec<u64> = (1..=3).collect();
        for v in &values {
            worker.push(NonNull::from(v));
        }
        while worker.pop().is_some() {}
        let bot = worker.shared.bot.load(Ordering::Relaxed);
        let top = worker.shared.top.load(Ordering::Relaxed);
        assert_eq!(worker.pop(), None);
        assert_eq!(worker.shared.bot.load(Ordering::Relaxed), bot);
        assert_eq!(worker.shared.top.load(Ordering::Relaxed), top);
        assert!(bot >= top);
    }

    #[test]
    fn ten_thousand_down_the_bottom() {
        let values: Vec<u64> = (0..10_000).collect();
        let mut worker = Worker::new();
        for v in &values {
            worker.push(NonNull::from(v));
        }
        for expected in (0..10_000u64).rev() {
            assert_eq!(worker.pop().map(value), Some(expected));
        }
        assert_eq!(worker.pop(), None);
    }

    #[test]
    fn twenty_thousand_off_the_top() {
        // Crosses the first block boundary partway through.
        let values: Vec<u64> = (1..=20_000).collect();
        let mut worker = Worker::new();
        let stealer = worker.stealer();
        for v in &values {
            worker.push(NonNull::from(v));
        }
        for expected in 1..=20_000u64 {
            assert_eq!(stealer.steal().task.map(value), Some(expected));
        }
        assert!(stealer.steal().empty_hint);
    }

    #[test]
    fn push_pop_cycles_across_block_boundaries() {
        let values: Vec<u64> = (1..=4).collect();
        let mut worker = Worker::new();
        let stealer = worker.stealer();

        // Park the indices just before a boundary, then bounce across it.
        let warmup = BLOCK_SLOTS as u64 - 2;
        for _ in 0..warmup {
            worker.push(NonNull::from(&values[0]));
        }
        for _ in 0..warmup {
            assert!(stealer.steal().task.is_some());
        }
        for _ in 0..8 {
            for v in &values {
                worker.push(NonNull::from(v));
            }
            let popped: Vec<u64> = (0..4).filter_map(|_| worker.pop().map(value)).collect();
            assert_eq!(popped, [4, 3, 2, 1]);
        }
        assert_eq!(worker.pop(), None);
    }

    #[test]
    fn reclaim_after_stealers_quiesce() {
        let values: Vec<u64> = (0..3 * BLOCK_SLOTS as u64).collect();
        let mut worker = Worker::new();
        let stealer = worker.stealer();
        for v in &values {
            worker.push(NonNull::from(v));
        }
        for v in &values {
            assert_eq!(stealer.steal().task.map(value), Some(*v));
        }
        // SAFETY: No steal is in flight in this single-threaded test.
        unsafe { worker.reclaim_retired() };
        // The deque keeps working with recycled blocks.
        for v in &values {
            worker.push(NonNull::from(v));
        }
        for expected in values.iter().rev() {
            assert_eq!(worker.pop().map(value), Some(*expected));
        }
    }

    proptest! {
        #[test]
        fn bottom_pops_reverse_the_pushes(values in prop::collection::vec(1u64..=u64::MAX, 1..300)) {
            let mut worker = Worker::new();
            for v in &values {
                worker.push(NonNull::from(v));
            }
            let popped: Vec<u64> = std::iter::from_fn(|| worker.pop().map(value)).collect();
            let mut expected = values.clone();
            expected.reverse();
            prop_assert_eq!(popped, expected);
        }

        #[test]
        fn top_steals_preserve_push_order(values in prop::collection::vec(1u64..=u64::MAX, 1..300)) {
            let mut worker = Worker::new();
            let stealer = worker.stealer();
            for v in &values {
                worker.push(NonNull::from(v));
            }
            let stolen: Vec<u64> = std::iter::from_fn(|| stealer.steal().task.map(value)).collect();
            prop_assert_eq!(stolen, values);
        }
    }
}
