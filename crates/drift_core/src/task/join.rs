#![expect(unsafe_code, reason = "manual pin projection for the join wrapper future")]

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use atomic_waker::AtomicWaker;

use crate::error::JoinError;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A monotonic task identifier, assigned at spawn time.
///
/// Used for debugging and for correlating a `JoinHandle` with the task it
/// observes; it has no effect on scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Shared state between a task's own poll loop and its `JoinHandle`.
///
/// This lives independently of the `async_task::Task` returned by
/// `async_task::Builder::spawn_unchecked`, which we detach immediately on
/// spawn: dropping a `JoinHandle` must let the task run to completion
/// (detach semantics), not cancel it, so the handle cannot be backed by
/// `async_task::Task` directly.
struct JoinState<T> {
    result: Mutex<Option<Result<T, JoinError>>>,
    join_waker: AtomicWaker,
    task_waker: AtomicWaker,
    abort: AtomicBool,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            join_waker: AtomicWaker::new(),
            task_waker: AtomicWaker::new(),
            abort: AtomicBool::new(false),
        }
    }

    fn complete(&self, value: Result<T, JoinError>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.join_waker.wake();
    }
}

/// The future actually driven by the scheduler: the user's future plus the
/// bookkeeping needed to report its result (or panic, or cancellation)
/// through a [`JoinHandle`] instead of through its own `Output`.
pub(crate) struct JoinTask<F: Future> {
    inner: F,
    state: Arc<JoinState<F::Output>>,
}

impl<F: Future> Future for JoinTask<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: `inner` is only ever touched through this function's pinned
        // projection, and `JoinTask` is only ever polled while pinned by the
        // executor, so it is never moved between polls.
        let this = unsafe { self.get_unchecked_mut() };

        this.state.task_waker.register(cx.waker());

        if this.state.abort.load(Ordering::Acquire) {
            this.state.complete(Err(JoinError::Cancelled));
            return Poll::Ready(());
        }

        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.state.complete(Ok(value));
                Poll::Ready(())
            }
            Err(payload) => {
                this.state.complete(Err(JoinError::Panicked(payload)));
                Poll::Ready(())
            }
        }
    }
}

/// A future that resolves when a spawned task completes, is cancelled, or
/// panics.
///
/// Dropping a `JoinHandle` detaches the task: it keeps running to
/// completion on the runtime, but its result is discarded. Use
/// [`JoinHandle::abort`] to request cancellation instead.
#[must_use = "a JoinHandle does nothing unless polled or awaited"]
pub struct JoinHandle<T> {
    id: TaskId,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(state: Arc<JoinState<T>>) -> Self {
        Self {
            id: TaskId::next(),
            state,
        }
    }

    /// The id assigned to this task at spawn time.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Requests cancellation of the task.
    ///
    /// Cancellation is cooperative: the task's future stops being polled at
    /// its next poll boundary rather than being forcibly interrupted. After
    /// `abort`, the handle resolves to `Err(JoinError::Cancelled)` (unless
    /// the task had already completed, in which case its real result is
    /// still delivered).
    pub fn abort(&self) {
        self.state.abort.store(true, Ordering::Release);
        self.state.task_waker.wake();
    }

    /// Returns `true` if the task has already finished, without consuming
    /// the result.
    pub fn is_finished(&self) -> bool {
        self.state
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self
            .state
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(result) = slot.take() {
            return Poll::Ready(result);
        }

        drop(slot);
        self.state.join_waker.register(cx.waker());

        slot = self
            .state
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id).finish()
    }
}

/// Wraps `future` for spawning and returns the pair the executor needs: the
/// task body to schedule, and the public handle observing its result.
pub(crate) fn wrap<F: Future>(future: F) -> (JoinTask<F>, JoinHandle<F::Output>) {
    let state = Arc::new(JoinState::new());
    let task = JoinTask {
        inner: future,
        state: state.clone(),
    };
    (task, JoinHandle::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::sync::atomic::AtomicUsize;

    fn noop_waker() -> std::task::Waker {
        use std::task::{RawWaker, RawWakerVTable, Waker};
        fn clone(_: *const ()) -> RawWaker {
            raw()
        }
        fn noop(_: *const ()) {}
        fn raw() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe { Waker::from_raw(raw()) }
    }

    #[test]
    fn completes_with_value() {
        let (mut task, mut handle) = wrap(async { 41 + 1 });
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut pinned = Pin::new(&mut task);
        assert_eq!(pinned.as_mut().poll(&mut cx), Poll::Ready(()));

        let mut handle_pinned = Pin::new(&mut handle);
        match handle_pinned.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 42),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn abort_is_observed_on_next_poll() {
        let hits = AtomicUsize::new(0);
        let (mut task, handle) = wrap(poll_fn(|_| {
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Poll::<()>::Pending
        }));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut pinned = Pin::new(&mut task);
        assert_eq!(pinned.as_mut().poll(&mut cx), Poll::Pending);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

        handle.abort();
        assert_eq!(pinned.as_mut().poll(&mut cx), Poll::Ready(()));
        // inner future is not polled again once cancellation is observed
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
