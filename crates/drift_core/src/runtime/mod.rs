//! `Builder`, `Runtime` and `Handle`: the public surface spec.md §4.8/§6
//! describes, assembled from the scheduler state in [`crate::worker`].
//!
//! Grounded in the teacher's `TaskPoolBuilder`/`TaskPool`
//! (`platform/multi/task_pool.rs`): the same builder-chain shape
//! (`thread_num`/`thread_name`/`stack_size`/`on_thread_spawn`/
//! `on_thread_destroy`, here `worker_threads`/`thread_name`/
//! `thread_stack_size`/`on_thread_start`/`on_thread_stop`), the same
//! `thread::Builder::new().name(..).stack_size(..).spawn(..).expect(..)`
//! spawn pattern, generalized from a fixed ECS-style task pool to this
//! crate's scheduler/reactor/timer-wheel worker loop.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::task::JoinHandle;
use crate::worker::{self, CurrentContext, CurrentGuard, Shared};

/// Default local deque capacity (spec.md §6's config table default).
const DEFAULT_QUEUE_CAPACITY: usize = 256;

type ThreadCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Builds a [`Runtime`] with spec.md §6's config knobs plus the teacher's
/// thread-lifecycle callbacks.
#[must_use]
pub struct Builder {
    worker_threads: Option<usize>,
    stack_size: Option<usize>,
    thread_name: Option<String>,
    enable_io: bool,
    enable_time: bool,
    queue_capacity: usize,
    on_thread_start: Option<ThreadCallback>,
    on_thread_stop: Option<ThreadCallback>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            worker_threads: None,
            stack_size: None,
            thread_name: None,
            enable_io: true,
            enable_time: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl Builder {
    /// Creates a builder with the default configuration: one worker per
    /// available core, a 256-slot local deque, and both the reactor and
    /// the timer wheel enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads. If unset, defaults to
    /// [`std::thread::available_parallelism`], falling back to 1.
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = Some(worker_threads);
        self
    }

    /// Sets the stack size for worker threads. If unset, the platform
    /// default is used.
    pub fn thread_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Sets a name prefix for worker threads; each thread is named
    /// `"{prefix}-{index}"`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Enables or disables the I/O reactor. Disabled reactors save a
    /// `polling::Poller` per runtime; registering an I/O source on a
    /// runtime built with `enable_io(false)` is a caller error (there is
    /// no reactor to register against).
    pub fn enable_io(mut self, enable: bool) -> Self {
        self.enable_io = enable;
        self
    }

    /// Enables or disables the hierarchical timer wheel.
    pub fn enable_time(mut self, enable: bool) -> Self {
        self.enable_time = enable;
        self
    }

    /// Sets the local work-stealing deque capacity per worker. Must be a
    /// non-zero power of two; validated in [`Builder::build`].
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Registers a callback run once on each worker thread right after it
    /// starts, before it enters the run loop.
    pub fn on_thread_start<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(callback));
        self
    }

    /// Registers a callback run once on each worker thread after it exits
    /// the run loop, right before the thread terminates.
    pub fn on_thread_stop<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_stop = Some(Arc::new(callback));
        self
    }

    /// Validates the configuration and spawns the worker pool.
    ///
    /// # Errors
    /// Returns [`RuntimeError::ConfigInvalid`] if `worker_threads` was
    /// explicitly set to `0` or `queue_capacity` is not a non-zero power
    /// of two. Returns [`RuntimeError::ReactorRegister`] if the reactor
    /// backend fails to initialize.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let worker_threads = match self.worker_threads {
            Some(0) => {
                return Err(RuntimeError::ConfigInvalid(
                    "worker_threads must be at least 1".into(),
                ))
            }
            Some(n) => n,
            None => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };

        if !self.queue_capacity.is_power_of_two() {
            return Err(RuntimeError::ConfigInvalid(format!(
                "queue_capacity must be a non-zero power of two, got {}",
                self.queue_capacity
            )));
        }

        let (shared, parkers) = worker::build_shared(
            worker_threads,
            self.queue_capacity,
            self.enable_io,
            self.enable_time,
        )?;

        let mut threads = Vec::with_capacity(worker_threads);
        for (index, parker) in parkers.into_iter().enumerate() {
            let thread_shared = shared.clone();
            let on_start = self.on_thread_start.clone();
            let on_stop = self.on_thread_stop.clone();

            let mut thread_builder = thread::Builder::new().name(
                self.thread_name
                    .as_deref()
                    .map(|prefix| format!("{prefix}-{index}"))
                    .unwrap_or_else(|| format!("drift-worker-{index}")),
            );
            if let Some(stack_size) = self.stack_size {
                thread_builder = thread_builder.stack_size(stack_size);
            }

            let handle = thread_builder
                .spawn(move || {
                    if let Some(callback) = on_start.as_ref() {
                        callback();
                    }
                    worker::run(thread_shared, index, parker);
                    if let Some(callback) = on_stop.as_ref() {
                        callback();
                    }
                })
                .expect("failed to spawn runtime worker thread");
            threads.push(handle);
        }

        Ok(Runtime {
            shared,
            threads: Some(threads),
        })
    }
}

/// A cheaply clonable handle to a [`Runtime`]'s shared scheduler state.
///
/// Outlives any individual task but not the `Runtime` itself: once the
/// runtime begins shutting down, `Handle::spawn` starts returning
/// [`RuntimeError::SpawnAfterShutdown`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Enqueues `future` as a new task and returns its [`JoinHandle`].
    /// Never blocks.
    ///
    /// # Errors
    /// Returns [`RuntimeError::SpawnAfterShutdown`] if the owning runtime
    /// has begun shutting down.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, RuntimeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RuntimeError::SpawnAfterShutdown);
        }
        Ok(worker::spawn_on(&self.shared, future))
    }
}

/// A multi-threaded, work-stealing async runtime: an owned pool of worker
/// threads plus the scheduler, reactor and timer-wheel state they share.
///
/// Dropping a `Runtime` that was never explicitly shut down blocks until
/// every worker thread has cleanly exited (see the `Drop` impl); prefer
/// [`Runtime::shutdown_timeout`] or [`Runtime::shutdown_background`] when
/// an unbounded join on drop is not acceptable.
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Option<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Builds a runtime with [`Builder::default`]'s configuration.
    pub fn new() -> Result<Self, RuntimeError> {
        Builder::new().build()
    }

    /// Returns a cheaply clonable [`Handle`] to this runtime.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Enqueues `future` as a new task and returns its [`JoinHandle`].
    /// Never blocks.
    ///
    /// # Errors
    /// Returns [`RuntimeError::SpawnAfterShutdown`] if shutdown has begun.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, RuntimeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn(future)
    }

    /// Drives `future` to completion on the calling thread while the
    /// worker pool continues to run every other spawned task
    /// concurrently.
    ///
    /// # Errors
    /// Returns [`RuntimeError::NestedBlockOn`] if the calling thread is
    /// already a worker of this (or any) runtime, or already inside
    /// another `block_on` call — both would deadlock the calling thread
    /// against itself.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, RuntimeError> {
        let _current = CurrentGuard::enter(CurrentContext::BlockOn {
            shared: self.shared.clone(),
        })
        .ok_or(RuntimeError::NestedBlockOn)?;
        Ok(futures_lite::future::block_on(future))
    }

    /// Sets the shutdown flag, wakes every worker, and blocks until all of
    /// them exit or `duration` elapses, whichever comes first. Any tasks
    /// still queued (local deques, LIFO slots, the injection queue) when a
    /// worker observes shutdown are dropped without being polled again.
    ///
    /// If `duration` elapses before every worker has exited, the
    /// still-running workers are left to finish in the background; this
    /// call does not block longer than `duration`.
    pub fn shutdown_timeout(&mut self, duration: Duration) {
        let Some(threads) = self.threads.take() else {
            return;
        };

        self.shared.shutdown.store(true, Ordering::Release);
        worker::notify_all(&self.shared);

        let (tx, rx) = mpsc::channel();
        // Detached: this joiner thread outlives `shutdown_timeout` if the
        // deadline elapses first, and finishes the join on its own.
        thread::spawn(move || {
            for handle in threads {
                let _ = handle.join();
            }
            let _ = tx.send(());
        });

        if rx.recv_timeout(duration).is_err() {
            tracing::warn!(?duration, "shutdown_timeout elapsed before all workers joined");
        }
    }

    /// Sets the shutdown flag and wakes every worker, then returns
    /// immediately without waiting for any of them to exit (a true
    /// detach: the worker threads keep running to completion on their
    /// own).
    pub fn shutdown_background(&mut self) {
        let Some(threads) = self.threads.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        worker::notify_all(&self.shared);
        drop(threads);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let Some(threads) = self.threads.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        worker::notify_all(&self.shared);
        for handle in threads {
            let _ = handle.join();
        }
    }
}

/// Spawns `future` onto the runtime the calling thread is currently part
/// of (a worker thread, or a thread inside [`Runtime::block_on`]).
///
/// This is the function [`drift::spawn`](../../drift/fn.spawn.html) and
/// `drift_core`'s own in-task code call; it is infallible because a task
/// spawning more work cannot observe its own runtime mid-shutdown in a way
/// that should be a catchable error (the new task is simply cancelled
/// along with everything else once shutdown drains it).
///
/// # Panics
/// Panics if the calling thread is not currently running inside a
/// [`Runtime`] (no worker, no `block_on`).
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let shared = worker::current_shared()
        .expect("drift::spawn called outside of a runtime worker thread or block_on");
    worker::spawn_on(&shared, future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn block_on_drives_future_to_completion() {
        let rt = Runtime::new().unwrap();
        let result = rt.block_on(async { 1 + 1 }).unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn spawn_runs_on_the_pool_and_joins() {
        let rt = Builder::new().worker_threads(2).build().unwrap();
        let result = rt.block_on(async {
            let handle = rt.spawn(async { 40 + 2 }).unwrap();
            handle.await.unwrap()
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn nested_block_on_is_rejected() {
        let rt = Runtime::new().unwrap();
        let outcome = rt.block_on(async {
            let inner = Runtime::new().unwrap();
            inner.block_on(async { 1 })
        });
        assert!(matches!(outcome, Ok(Err(RuntimeError::NestedBlockOn))));
    }

    #[test]
    fn spawn_after_shutdown_is_rejected() {
        let mut rt = Builder::new().worker_threads(1).build().unwrap();
        rt.shutdown_background();
        let err = rt.spawn(async {}).unwrap_err();
        assert!(matches!(err, RuntimeError::SpawnAfterShutdown));
    }

    #[test]
    fn build_rejects_zero_worker_threads() {
        let err = Builder::new().worker_threads(0).build().unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigInvalid(_)));
    }

    #[test]
    fn build_rejects_non_power_of_two_queue_capacity() {
        let err = Builder::new().queue_capacity(100).build().unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigInvalid(_)));
    }

    #[test]
    fn many_tasks_complete_under_the_default_pool() {
        let rt = Runtime::new().unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        rt.block_on(async {
            let mut handles = Vec::new();
            for _ in 0..500 {
                let completed = completed.clone();
                handles.push(spawn(async move {
                    completed.fetch_add(1, Ordering::Relaxed);
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .unwrap();
        assert_eq!(completed.load(Ordering::Relaxed), 500);
    }
}
