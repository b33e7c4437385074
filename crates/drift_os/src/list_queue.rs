#![expect(unsafe_code, reason = "original implementation need unsafe codes")]

use std::cell::Cell;
use std::fmt;
use std::mem::MaybeUninit;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Release};

use crate::{CachePadded, SpinLock, SpinLockGuard};

const BLOCK_SIZE: usize = 64;

/// A single queue block: a fixed array of 64 slots plus a link to the next
/// block once it fills up.
struct Block<T> {
    /// (next slot to pop, cached occupancy bitmap)
    head_cache: CachePadded<(usize, u64)>,
    /// (next slot to push, occupancy bitmap)
    tail_state: CachePadded<(usize, AtomicU64)>,
    slots: [MaybeUninit<T>; BLOCK_SIZE],
    next: *mut Block<T>,
}

impl<T> Block<T> {
    #[cold]
    #[inline(never)]
    fn new() -> Box<Self> {
        Box::new(Block {
            head_cache: CachePadded::new((0, 0)),
            tail_state: CachePadded::new((0, AtomicU64::new(0))),
            slots: unsafe { MaybeUninit::uninit().assume_init() },
            next: ptr::null_mut(),
        })
    }

    fn reset(&mut self) {
        self.head_cache.0 = 0;
        self.head_cache.1 = 0;
        self.tail_state.0 = 0;
        self.tail_state.1.store(0, Release);
        self.next = ptr::null_mut();
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        let index = self.head_cache.0;
        let end = self.tail_state.0;
        if index < end {
            unsafe {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                    self.slots.as_mut_ptr().add(index) as *mut T,
                    end - index,
                ));
            }
        }
    }
}

/// Pool of detached blocks kept around for reuse, bounded so a burst of
/// activity cannot pin down unbounded memory.
struct IdleBlocks<T> {
    blocks: SpinLock<Vec<Box<Block<T>>>>,
    max_num: Cell<usize>,
}

unsafe impl<T: Send> Sync for IdleBlocks<T> {}

impl<T> IdleBlocks<T> {
    const fn new(idle_limit: usize) -> Self {
        Self {
            blocks: SpinLock::new(Vec::new()),
            max_num: Cell::new(idle_limit),
        }
    }

    fn push(&self, ptr: *mut Block<T>) {
        let boxed = unsafe { Box::from_raw(ptr) };
        let mut blocks = self.blocks.lock();
        if blocks.len() < self.max_num.get() {
            blocks.push(boxed);
        }
        drop(blocks);
    }

    fn get(&self) -> *mut Block<T> {
        let boxed = self.blocks.lock().pop();
        if let Some(mut boxed) = boxed {
            boxed.reset();
            Box::leak(boxed)
        } else {
            Box::leak(Block::<T>::new())
        }
    }
}

/// An unbounded MPMC queue built from a linked list of recycled blocks.
///
/// This backs [`InjectionQueue`](../../drift_core/struct.InjectionQueue.html):
/// the scheduler's global run queue for tasks spawned off-worker or
/// overflowing a local deque. Head and tail live behind their own short
/// spin-lock critical sections rather than a single queue-wide lock, so
/// producers and consumers on different blocks never contend with each
/// other, and detached blocks are recycled through an idle pool instead of
/// being freed and reallocated on every burst.
pub struct ListQueue<T> {
    head_id: CachePadded<SpinLock<(*mut Block<T>, usize)>>,
    tail_id: CachePadded<SpinLock<(*mut Block<T>, usize)>>,
    idle: IdleBlocks<T>,
}

unsafe impl<T: Send> Send for ListQueue<T> {}
unsafe impl<T: Send> Sync for ListQueue<T> {}
impl<T> UnwindSafe for ListQueue<T> {}
impl<T> RefUnwindSafe for ListQueue<T> {}

impl<T> Default for ListQueue<T> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_IDLE_LIMIT)
    }
}

impl<T> ListQueue<T> {
    /// Blocks kept idle by default once the queue drains; tuned so a burst
    /// of a few thousand tasks doesn't repeatedly allocate fresh blocks.
    pub const DEFAULT_IDLE_LIMIT: usize = 16;

    /// Creates a queue that recycles at most `idle_limit` detached blocks;
    /// blocks freed beyond that are dropped instead of pooled.
    pub fn new(idle_limit: usize) -> Self {
        let idle = IdleBlocks::new(idle_limit);
        let block = Box::leak(Block::<T>::new());
        Self {
            idle,
            head_id: CachePadded::new(SpinLock::new((block, 0))),
            tail_id: CachePadded::new(SpinLock::new((block, 0))),
        }
    }

    /// Pushes a value onto the tail of the queue.
    pub fn push(&self, value: T) {
        let mut guard = self.tail_id.lock();
        self.push_locked(&mut guard, value);
    }

    fn push_locked(&self, guard: &mut SpinLockGuard<'_, (*mut Block<T>, usize)>, value: T) {
        let block = unsafe { &mut *guard.0 };
        let index = block.tail_state.0;
        debug_assert!(index < BLOCK_SIZE);

        unsafe {
            ptr::write(block.slots.as_mut_ptr().add(index) as *mut T, value);
        }

        if index + 1 == BLOCK_SIZE {
            let new_block = self.idle.get();
            block.next = new_block;
            guard.0 = new_block;
            guard.1 = guard.1.wrapping_add(1);
        }

        block.tail_state.0 = index + 1;
        block.tail_state.1.fetch_or(1 << index, Release);
    }

    /// Pops a value from the head of the queue, or `None` if empty.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.head_id.lock();
        self.pop_locked(&mut guard)
    }

    fn pop_locked(&self, guard: &mut SpinLockGuard<'_, (*mut Block<T>, usize)>) -> Option<T> {
        let block = unsafe { &mut *guard.0 };
        let index = block.head_cache.0;
        debug_assert!(index < BLOCK_SIZE);

        let bit = 1_u64 << index;
        if block.head_cache.1 & bit == 0 {
            block.head_cache.1 = block.tail_state.1.load(Acquire);
            if block.head_cache.1 & bit == 0 {
                return None;
            }
        }

        let value = unsafe { ptr::read(block.slots.as_ptr().add(index) as *const T) };
        let new_index = index + 1;
        block.head_cache.0 = new_index;

        if new_index == BLOCK_SIZE {
            let old_ptr = block as *mut Block<T>;
            let next_ptr = block.next;
            debug_assert!(!next_ptr.is_null());
            guard.0 = next_ptr;
            guard.1 = guard.1.wrapping_add(1);
            self.idle.push(old_ptr);
        }

        Some(value)
    }

    /// Pops up to `limit` values in one critical section, appending them to
    /// `out`. Returns the number popped. Used by workers to drain a batch
    /// instead of paying per-item lock overhead.
    pub fn drain_some(&self, limit: usize, out: &mut Vec<T>) -> usize {
        let mut guard = self.head_id.lock();
        let mut n = 0;
        while n < limit {
            match self.pop_locked(&mut guard) {
                Some(v) => {
                    out.push(v);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Heuristic emptiness check; reliable from a single consumer, may be
    /// stale the instant it returns under MPMC contention.
    pub fn is_empty(&self) -> bool {
        let mut guard = self.head_id.lock();
        let block = unsafe { &mut *guard.0 };
        let index = block.head_cache.0;
        let bit = 1_u64 << index;
        if block.head_cache.1 & bit == 0 {
            block.head_cache.1 = block.tail_state.1.load(Acquire);
            return block.head_cache.1 & bit == 0;
        }
        false
    }
}

impl<T> Drop for ListQueue<T> {
    fn drop(&mut self) {
        let mut ptr = self.head_id.lock().0;
        while !ptr.is_null() {
            unsafe {
                let boxed = Box::from_raw(ptr);
                ptr = boxed.next;
                drop(boxed);
            }
        }
    }
}

impl<T> fmt::Debug for ListQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ListQueue { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::ListQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn smoke() {
        let q = ListQueue::default();
        q.push(7);
        assert_eq!(q.pop(), Some(7));
        q.push(8);
        assert_eq!(q.pop(), Some(8));
        assert!(q.pop().is_none());
    }

    #[test]
    fn fifo_per_producer() {
        let q = ListQueue::default();
        for i in 0..200 {
            q.push(i);
        }
        for i in 0..200 {
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn drain_some_batches() {
        let q = ListQueue::default();
        for i in 0..10 {
            q.push(i);
        }
        let mut out = Vec::new();
        let n = q.drain_some(4, &mut out);
        assert_eq!(n, 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        let n = q.drain_some(100, &mut out);
        assert_eq!(n, 6);
    }

    #[test]
    fn mpmc_spans_blocks() {
        const COUNT: usize = 25_000;
        const THREADS: usize = 4;

        let q = ListQueue::<usize>::default();
        let seen = (0..COUNT).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..COUNT {
                        let n = loop {
                            if let Some(x) = q.pop() {
                                break x;
                            }
                        };
                        seen[n].fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for i in 0..COUNT {
                        q.push(i);
                    }
                });
            }
        });

        for c in seen {
            assert_eq!(c.load(Ordering::SeqCst), THREADS);
        }
    }
}
