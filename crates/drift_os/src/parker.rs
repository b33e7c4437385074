use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const EMPTY: usize = 0;
const PARKED: usize = 1;
const NOTIFIED: usize = 2;

struct Inner {
    state: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

/// The parking half of a park/unpark pair.
///
/// A worker thread that finds no runnable task calls [`Parker::park`] (or
/// [`Parker::park_timeout`], used to wake up for an expiring timer even with
/// no one to unpark it). A matching [`Unparker`] wakes it. A notification
/// that arrives before the worker parks is not lost: `unpark` sets a flag
/// that the next `park` call consumes immediately instead of blocking, the
/// same guarantee `std::thread::park`/`Thread::unpark` make.
pub struct Parker {
    inner: Arc<Inner>,
}

/// The waking half of a park/unpark pair, cloneable and shareable across
/// threads so any worker (or the reactor, on an external wakeup) can unpark
/// a sleeping one.
#[derive(Clone)]
pub struct Unparker {
    inner: Arc<Inner>,
}

impl Parker {
    /// Creates a fresh park/unpark pair in the not-parked, not-notified
    /// state.
    pub fn new() -> Self {
        Parker {
            inner: Arc::new(Inner {
                state: AtomicUsize::new(EMPTY),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Returns a handle that can unpark this parker from another thread.
    pub fn unparker(&self) -> Unparker {
        Unparker {
            inner: self.inner.clone(),
        }
    }

    /// Blocks the current thread until unparked.
    pub fn park(&self) {
        self.inner.park(None);
    }

    /// Blocks the current thread until unparked or `timeout` elapses,
    /// returning `true` if woken by an unpark rather than timing out. Used
    /// when a pending timer needs the worker to wake even without new work.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        self.inner.park(Some(timeout))
    }

    /// Blocks until unparked or `deadline` passes.
    pub fn park_deadline(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if deadline <= now {
            return self.inner.consume_notification();
        }
        self.inner.park(Some(deadline - now))
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Parker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Parker { .. }")
    }
}

impl Unparker {
    /// Wakes the matching parker. If it isn't currently parked, the
    /// notification is stored and consumed by the next `park` call.
    pub fn unpark(&self) {
        self.inner.unpark();
    }
}

impl fmt::Debug for Unparker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Unparker { .. }")
    }
}

impl Inner {
    /// Returns `true` if a pending notification was consumed without
    /// blocking.
    fn consume_notification(&self) -> bool {
        self.state
            .compare_exchange(NOTIFIED, EMPTY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.consume_notification() {
            return true;
        }

        match self
            .state
            .compare_exchange(EMPTY, PARKED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(NOTIFIED) => {
                // A notification raced in between our fast-path check and
                // the CAS; consume it instead of sleeping.
                self.state.store(EMPTY, Ordering::SeqCst);
                return true;
            }
            Err(_) => unreachable!("parker state corrupted"),
        }

        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            match deadline {
                None => {
                    guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (g, _timeout_result) = self
                        .cond
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    guard = g;
                }
            }

            match self
                .state
                .compare_exchange(NOTIFIED, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(PARKED) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        break;
                    }
                    continue;
                }
                Err(_) => unreachable!("parker state corrupted"),
            }
        }

        // Timed out. Flip PARKED back to EMPTY unless an unpark landed in
        // the gap, in which case treat this as a successful wakeup.
        match self
            .state
            .compare_exchange(PARKED, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => false,
            Err(NOTIFIED) => {
                self.state.store(EMPTY, Ordering::SeqCst);
                true
            }
            Err(_) => unreachable!("parker state corrupted"),
        }
    }

    fn unpark(&self) {
        match self.state.swap(NOTIFIED, Ordering::SeqCst) {
            EMPTY | NOTIFIED => return,
            PARKED => {}
            _ => unreachable!("parker state corrupted"),
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::Parker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        let unparker = parker.unparker();
        unparker.unpark();
        assert!(parker.park_timeout(Duration::from_millis(100)));
    }

    #[test]
    fn park_timeout_elapses_without_unpark() {
        let parker = Parker::new();
        assert!(!parker.park_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn cross_thread_wakeup() {
        let parker = Parker::new();
        let unparker = parker.unparker();
        let woke = Arc::new(AtomicBool::new(false));
        let woke2 = woke.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            woke2.store(true, Ordering::SeqCst);
            unparker.unpark();
        });

        parker.park();
        assert!(woke.load(Ordering::SeqCst));
        handle.join().unwrap();
    }
}
