use async_task::Runnable;
use drift_os::ListQueue;

/// The global run queue: runnables that overflowed a worker's local deque,
/// or were spawned from outside any worker thread, land here. Workers only
/// check it periodically (the "maintenance tick" in spec terms) so local
/// deques stay the hot path.
pub(crate) struct InjectionQueue {
    queue: ListQueue<Runnable>,
}

impl InjectionQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: ListQueue::default(),
        }
    }

    pub(crate) fn push(&self, runnable: Runnable) {
        self.queue.push(runnable);
    }

    pub(crate) fn pop(&self) -> Option<Runnable> {
        self.queue.pop()
    }

    /// Drains up to `limit` runnables into `out`, returning how many were
    /// taken. Used by a worker refilling its local deque in one batch
    /// instead of one global-queue round trip per task.
    pub(crate) fn drain_some(&self, limit: usize, out: &mut Vec<Runnable>) -> usize {
        self.queue.drain_some(limit, out)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
