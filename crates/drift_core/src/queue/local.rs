#![expect(unsafe_code, reason = "Chase-Lev deque requires raw slot access")]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use drift_os::CachePadded;

/// The outcome of a [`WorkStealingDeque::steal`] or
/// [`WorkStealingDeque::steal_many`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The deque had nothing to steal.
    Empty,
    /// A concurrent owner pop or another steal won the race; the caller
    /// should pick a different victim or retry.
    Retry,
    /// The value (or, for `steal_many`, the first of a claimed batch).
    Success(T),
}

/// A bounded Chase-Lev work-stealing deque.
///
/// The owning worker pushes and pops from the tail end using ordinary
/// non-atomic index reads and a release-store to publish growth; thieves
/// steal from the head end using acquire loads and a compare-and-swap on
/// `head`. Capacity is fixed at construction and must be a power of two;
/// a full push does not block or panic, it returns the value back to the
/// caller so it can be routed to the injection queue instead.
pub struct WorkStealingDeque<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for WorkStealingDeque<T> {}
unsafe impl<T: Send> Sync for WorkStealingDeque<T> {}

impl<T> WorkStealingDeque<T> {
    /// Creates an empty deque. `capacity` must be a power of two.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or not a power of two; callers
    /// (`Builder::build`) are expected to validate this ahead of time and
    /// surface `RuntimeError::ConfigInvalid` instead of reaching here.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two() && capacity > 0);
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
            buffer,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    unsafe fn read(&self, index: usize) -> T {
        let slot = &self.buffer[index & self.mask];
        unsafe { (*slot.get()).as_ptr().read() }
    }

    unsafe fn write(&self, index: usize, value: T) {
        let slot = &self.buffer[index & self.mask];
        unsafe { (*slot.get()).as_mut_ptr().write(value) };
    }

    /// An approximate length, valid from the owner thread or as a hint from
    /// anywhere else (may be stale under concurrent steals/pops).
    pub fn len(&self) -> usize {
        let t = self.tail.load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Acquire);
        t.wrapping_sub(h).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only. Pushes a value onto the tail. Returns the value back on
    /// overflow instead of blocking; the caller routes it to the injection
    /// queue.
    pub fn push(&self, value: T) -> Result<(), T> {
        let t = self.tail.load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Acquire);

        if t.wrapping_sub(h) >= self.capacity() {
            return Err(value);
        }

        unsafe { self.write(t, value) };
        self.tail.store(t.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Owner-only. Pops from the tail (LIFO), contending with thieves only
    /// when a single item remains.
    pub fn pop(&self) -> Option<T> {
        let t = self.tail.load(Ordering::Relaxed);
        let new_t = t.wrapping_sub(1);
        self.tail.store(new_t, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let h = self.head.load(Ordering::Acquire);
        let len = (new_t.wrapping_sub(h)) as isize;

        if len < 0 {
            // A thief already emptied the deque; restore tail.
            self.tail.store(t, Ordering::Relaxed);
            return None;
        }

        let value = unsafe { self.read(new_t) };

        if len == 0 {
            if self
                .head
                .compare_exchange(h, h.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // Lost the race to a thief; our copy must not be dropped.
                std::mem::forget(value);
                self.tail.store(t, Ordering::Relaxed);
                return None;
            }
            self.tail.store(t, Ordering::Relaxed);
        }

        Some(value)
    }

    /// Any thread. Steals a single item from the head (FIFO).
    pub fn steal(&self) -> Steal<T> {
        let h = self.head.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let t = self.tail.load(Ordering::Acquire);
        let len = (t.wrapping_sub(h)) as isize;

        if len <= 0 {
            return Steal::Empty;
        }

        let value = unsafe { self.read(h) };

        if self
            .head
            .compare_exchange(h, h.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            std::mem::forget(value);
            return Steal::Retry;
        }

        Steal::Success(value)
    }

    /// Any thread. Steals up to half of the deque's contents (at least one
    /// item), pushing everything but the first into `dest` and returning
    /// the first to the caller so it can run it immediately.
    ///
    /// `dest` is the thief's own deque and must only be driven as an owner
    /// from the stealing thread.
    pub fn steal_many(&self, dest: &Self) -> Steal<T> {
        let h = self.head.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let t = self.tail.load(Ordering::Acquire);
        let len = (t.wrapping_sub(h)) as isize;

        if len <= 0 {
            return Steal::Empty;
        }

        let take = ((len as usize).div_ceil(2)).max(1).min(len as usize);

        // Read before publishing the `head` advance, exactly like the
        // single-item `steal` above: until the CAS below succeeds, the
        // owner still considers these slots live and is free to `push`
        // over them the instant it wraps back around. Reading first and
        // only then racing the CAS means a lost race just discards our
        // copies instead of having handed out slots the owner is about to
        // overwrite.
        let mut taken = Vec::with_capacity(take);
        for offset in 0..take {
            taken.push(unsafe { self.read(h.wrapping_add(offset)) });
        }

        if self
            .head
            .compare_exchange(h, h.wrapping_add(take), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race; these reads never happened as far as the
            // deque is concerned. The slots are still owned by whichever
            // operation wins the race on `head` (a concurrent pop or
            // another steal), so our copies must not be dropped here.
            for value in taken {
                std::mem::forget(value);
            }
            return Steal::Retry;
        }

        let mut iter = taken.into_iter();
        let first = iter.next().expect("take >= 1");
        for value in iter {
            if let Err(dropped) = dest.push(value) {
                // dest should have room (it was empty before the steal);
                // if not, drop the overflow rather than losing the slot.
                drop(dropped);
            }
        }

        Steal::Success(first)
    }
}

impl<T> Drop for WorkStealingDeque<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
