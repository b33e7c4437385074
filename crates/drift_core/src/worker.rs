//! Per-thread run loop and the state shared between every worker and the
//! `runtime` module's `Builder`/`Runtime`/`Handle`.
//!
//! Each worker runs a plain OS thread loop: periodic global-queue
//! stealing, random-victim work stealing between local deques, and
//! thundering-herd-safe wakeups via a searcher count, with workers
//! blocking and waking through `drift_os::Parker`/`Unparker` rather than
//! through a task waker.

use std::cell::{RefCell, UnsafeCell};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_task::Runnable;

use drift_os::{Backoff, Parker, Unparker};

use crate::error::RuntimeError;
use crate::queue::{InjectionQueue, Steal, WorkStealingDeque};
use crate::reactor::Reactor;
use crate::task::{JoinHandle, XorShift64Star};
use crate::time::TimerWheel;

/// Tasks processed before a worker forces a check of the injection queue
/// even though its own LIFO slot or local deque still has work (the
/// "maintenance tick"), so injected and overflowed work is never starved
/// by a worker that always finds something locally.
const MAINTENANCE_INTERVAL: u32 = 61;

/// Upper bound on how long a worker blocks in `Reactor::poll`, regardless
/// of the timer wheel's next deadline. Keeps a worker responsive to
/// shutdown even with no timers registered.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How many times a thief retries a single victim after a `Steal::Retry`
/// (a race lost against the victim's own pop) before moving to the next
/// victim, rather than spinning indefinitely.
const STEAL_RETRY_LIMIT: u32 = 8;

/// Per-worker state visible to every other worker (for stealing and
/// waking) and to `schedule` calls made from any thread.
struct Remote {
    queue: WorkStealingDeque<Runnable>,
    /// The LIFO slot: the most recently woken task runs next, ahead of
    /// anything already queued, which favors request/response chains.
    /// Written and read only by the worker thread that owns this
    /// `Remote`; see the safety comments at each access site.
    lifo_slot: UnsafeCell<Option<Runnable>>,
    unparker: Unparker,
    parked: AtomicBool,
}

// SAFETY: `lifo_slot`'s `UnsafeCell` is mutated only by the worker thread
// that owns this `Remote`, verified at every access site via the
// `CURRENT` thread-local before dereferencing. `queue` and the other
// fields already have their own synchronization.
unsafe impl Sync for Remote {}

/// State shared by every worker thread and by `Runtime`/`Handle`.
///
/// Owned by an `Arc` cloned into each worker's thread closure, into every
/// `schedule` closure handed to `async_task`, and into every `Handle`.
pub(crate) struct Shared {
    remotes: Box<[Remote]>,
    pub(crate) inject: InjectionQueue,
    reactor: Option<Reactor>,
    timers: Option<TimerWheel>,
    num_searching: AtomicUsize,
    reactor_busy: AtomicBool,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn reactor(&self) -> Option<&Reactor> {
        self.reactor.as_ref()
    }

    pub(crate) fn timers(&self) -> Option<&TimerWheel> {
        self.timers.as_ref()
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.remotes.len()
    }
}

/// Builds the shared scheduler state and one `Parker`/`Unparker` pair per
/// worker; the caller moves each `Parker` into its worker's thread
/// closure while `Shared` keeps the matching `Unparker`.
pub(crate) fn build_shared(
    worker_count: usize,
    queue_capacity: usize,
    enable_io: bool,
    enable_time: bool,
) -> Result<(Arc<Shared>, Vec<Parker>), RuntimeError> {
    let mut remotes = Vec::with_capacity(worker_count);
    let mut parkers = Vec::with_capacity(worker_count);

    for _ in 0..worker_count {
        let parker = Parker::new();
        remotes.push(Remote {
            queue: WorkStealingDeque::new(queue_capacity),
            lifo_slot: UnsafeCell::new(None),
            unparker: parker.unparker(),
            parked: AtomicBool::new(false),
        });
        parkers.push(parker);
    }

    let reactor = if enable_io { Some(Reactor::new()?) } else { None };
    let timers = if enable_time {
        Some(TimerWheel::new(Duration::from_millis(1)))
    } else {
        None
    };

    let shared = Arc::new(Shared {
        remotes: remotes.into_boxed_slice(),
        inject: InjectionQueue::new(),
        reactor,
        timers,
        num_searching: AtomicUsize::new(0),
        reactor_busy: AtomicBool::new(false),
        shutdown: AtomicBool::new(false),
    });

    Ok((shared, parkers))
}

/// Which kind of thread is currently executing, if any: a pool worker
/// bound to a `Remote`, or a thread inside `Handle::block_on`. Both count
/// as "already current" for the purpose of rejecting nested `block_on`.
#[derive(Clone)]
pub(crate) enum CurrentContext {
    Worker { shared: Arc<Shared>, index: usize },
    BlockOn { shared: Arc<Shared> },
}

impl CurrentContext {
    fn shared(&self) -> &Arc<Shared> {
        match self {
            CurrentContext::Worker { shared, .. } => shared,
            CurrentContext::BlockOn { shared } => shared,
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentContext>> = const { RefCell::new(None) };
}

/// The `Arc<Shared>` of the runtime the calling thread is currently
/// executing on behalf of (worker or `block_on`), if any.
pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.shared().clone()))
}

/// A RAII guard that installs a `CurrentContext` for the calling thread
/// and clears it on drop (including on unwind, so a panicking task or
/// `block_on` future never leaves the thread-local poisoned).
pub(crate) struct CurrentGuard(());

impl CurrentGuard {
    /// Installs `ctx` as current, or returns `None` if this thread is
    /// already current for some runtime (nested `block_on`, or a worker
    /// thread re-entering through `block_on`).
    pub(crate) fn enter(ctx: CurrentContext) -> Option<Self> {
        let already = CURRENT.with(|c| c.borrow().is_some());
        if already {
            return None;
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
        Some(CurrentGuard(()))
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = None);
    }
}

/// Wraps `future` as a task scheduled on `shared` and returns its
/// `JoinHandle`. Used by `Handle::spawn`, `Runtime::spawn` and the free
/// `runtime::spawn` function alike; callers are responsible for rejecting
/// spawns after shutdown where spec'd (`Handle::spawn`) and letting them
/// through unconditionally where not (direct in-task spawn).
pub(crate) fn spawn_on<F>(shared: &Arc<Shared>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let scheduler_shared = shared.clone();
    let (runnable, handle) =
        crate::task::spawn(future, move |runnable| schedule(&scheduler_shared, runnable));
    runnable.schedule();
    handle
}

/// The scheduler's only integration point with the task model: invoked on
/// first spawn and every time a `Waker` fires. Routes to the calling
/// thread's own `Remote` when that thread is a worker bound to `shared`;
/// otherwise to the injection queue.
fn schedule(shared: &Arc<Shared>, runnable: Runnable) {
    let local_index = CURRENT.with(|c| match c.borrow().as_ref() {
        Some(CurrentContext::Worker { shared: cur, index }) if Arc::ptr_eq(cur, shared) => {
            Some(*index)
        }
        _ => None,
    });

    match local_index {
        Some(index) => schedule_local(shared, index, runnable),
        None => {
            shared.inject.push(runnable);
            notify_one(shared);
        }
    }
}

fn schedule_local(shared: &Arc<Shared>, index: usize, runnable: Runnable) {
    let remote = &shared.remotes[index];

    // SAFETY: `schedule` only reaches this branch when the calling thread
    // is the worker that owns `index`, so this call is the sole writer of
    // `lifo_slot` for its duration.
    let slot = unsafe { &mut *remote.lifo_slot.get() };
    if let Some(displaced) = slot.replace(runnable) {
        if let Err(overflowed) = remote.queue.push(displaced) {
            shared.inject.push(overflowed);
        }
    }
    notify_one(shared);
}

/// Wakes at most one parked worker, skipping the wakeup if a worker is
/// already searching (it is likely to find the new work on its own). This
/// is what keeps a burst of wakeups from unparking every idle worker at
/// once.
fn notify_one(shared: &Arc<Shared>) {
    if shared.num_searching.load(Ordering::Acquire) > 0 {
        return;
    }
    for remote in shared.remotes.iter() {
        if remote
            .parked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            remote.unparker.unpark();
            return;
        }
    }
}

/// Wakes every worker unconditionally; used on shutdown so no parked
/// worker misses the shutdown flag.
pub(crate) fn notify_all(shared: &Arc<Shared>) {
    for remote in shared.remotes.iter() {
        remote.parked.store(false, Ordering::Release);
        remote.unparker.unpark();
    }
}

/// Entry point for a worker thread: installs this thread as current,
/// drives the run loop until shutdown, then drains this worker's own
/// queued work (cancelling it) before returning.
pub(crate) fn run(shared: Arc<Shared>, index: usize, parker: Parker) {
    let _current = CurrentGuard::enter(CurrentContext::Worker {
        shared: shared.clone(),
        index,
    })
    .expect("a freshly spawned worker thread never already has a current context");

    let rng = XorShift64Star::fixed();
    rng.randomize();
    let mut tick: u32 = 0;

    let span = tracing::debug_span!("worker", worker_id = index);
    let _entered = span.enter();
    tracing::debug!("worker started");

    loop {
        tick = tick.wrapping_add(1);
        let maintenance = tick % MAINTENANCE_INTERVAL == 0;

        if let Some(runnable) = next_task(&shared, index, &rng, maintenance) {
            runnable.run();
            continue;
        }

        if poll_reactor_and_timers(&shared) {
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        park(&shared, index, &parker);
    }

    drain_on_shutdown(&shared, index);
    tracing::debug!("worker stopping");
}

/// One pass of the "find work" ladder: maintenance-tick injection check,
/// LIFO slot, local deque, batched injection drain, then stealing.
fn next_task(
    shared: &Arc<Shared>,
    index: usize,
    rng: &XorShift64Star,
    maintenance: bool,
) -> Option<Runnable> {
    let remote = &shared.remotes[index];

    if maintenance {
        if let Some(runnable) = shared.inject.pop() {
            return Some(runnable);
        }
    }

    // SAFETY: this runs on the worker thread that owns `index`.
    let slot = unsafe { &mut *remote.lifo_slot.get() };
    if let Some(runnable) = slot.take() {
        return Some(runnable);
    }

    if let Some(runnable) = remote.queue.pop() {
        return Some(runnable);
    }

    let mut batch = Vec::new();
    if shared.inject.drain_some(remote.queue.capacity(), &mut batch) > 0 {
        let mut iter = batch.into_iter();
        let first = iter.next();
        for runnable in iter {
            if let Err(overflowed) = remote.queue.push(runnable) {
                shared.inject.push(overflowed);
            }
        }
        return first;
    }

    try_steal(shared, index, rng)
}

/// Random-victim work stealing (spec.md §4.7 `try_steal`): picks a random
/// starting peer and walks the ring once, stealing up to half of the
/// first non-empty victim's deque. Tracked via `num_searching` so
/// `notify_one` can skip waking a peer while a search is already underway.
fn try_steal(shared: &Arc<Shared>, index: usize, rng: &XorShift64Star) -> Option<Runnable> {
    if shared.remotes.len() <= 1 {
        return None;
    }

    shared.num_searching.fetch_add(1, Ordering::AcqRel);
    let found = steal_round(shared, index, rng);
    shared.num_searching.fetch_sub(1, Ordering::AcqRel);
    found
}

fn steal_round(shared: &Arc<Shared>, index: usize, rng: &XorShift64Star) -> Option<Runnable> {
    let worker_count = shared.remotes.len();
    let start = rng.next_usize(worker_count);
    let backoff = Backoff::new();

    for offset in 0..worker_count {
        let victim = (start + offset) % worker_count;
        if victim == index {
            continue;
        }

        let mut retries = 0;
        loop {
            match shared.remotes[victim].queue.steal_many(&shared.remotes[index].queue) {
                Steal::Success(runnable) => return Some(runnable),
                Steal::Empty => break,
                Steal::Retry if retries < STEAL_RETRY_LIMIT => {
                    retries += 1;
                    backoff.spin();
                }
                Steal::Retry => break,
            }
        }
    }

    None
}

/// Polls the reactor (if this worker wins the single-poller CAS) and
/// advances the timer wheel. Returns `true` if the caller should loop back
/// to `next_task` immediately instead of falling through to parking,
/// because this call may have produced freshly-runnable tasks.
fn poll_reactor_and_timers(shared: &Arc<Shared>) -> bool {
    let Some(reactor) = shared.reactor() else {
        // No reactor means no periodic backstop: a fired timer reschedules
        // its task onto this very worker (the only one currently handling
        // time), via `schedule_local`, which does not unpark anyone. If we
        // reported `false` unconditionally here, the caller would fall
        // through straight to `park()` and never notice the task it just
        // put in its own LIFO slot. Report whether anything actually fired
        // so the caller loops back through `next_task` first.
        return shared
            .timers()
            .map(|timers| timers.advance(Instant::now()))
            .unwrap_or(false);
    };

    if shared
        .reactor_busy
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Another worker already owns the reactor-poll role this round.
        return false;
    }

    let timeout = shared
        .timers()
        .and_then(|timers| timers.next_deadline())
        .unwrap_or(DEFAULT_POLL_TIMEOUT)
        .min(DEFAULT_POLL_TIMEOUT);

    let outcome = reactor.poll(Some(timeout));

    if let Some(timers) = shared.timers() {
        timers.advance(Instant::now());
    }

    shared.reactor_busy.store(false, Ordering::Release);

    if let Err(err) = outcome {
        tracing::error!(error = %err, "reactor poll failed; shutting down runtime");
        shared.shutdown.store(true, Ordering::Release);
        notify_all(shared);
    }

    true
}

/// Parks until unparked, shutdown, or the next timer deadline, whichever
/// comes first. Registers `parked` before the final shutdown check so a
/// concurrent `notify_one`/`notify_all` racing in cannot be lost: `Parker`
/// remembers an `unpark` that arrives before the matching `park` call.
fn park(shared: &Arc<Shared>, index: usize, parker: &Parker) {
    let remote = &shared.remotes[index];
    remote.parked.store(true, Ordering::Release);

    if shared.shutdown.load(Ordering::Acquire) {
        remote.parked.store(false, Ordering::Release);
        return;
    }

    match shared.timers().and_then(|timers| timers.next_deadline()) {
        Some(deadline) => {
            parker.park_timeout(deadline);
        }
        None => parker.park(),
    }

    remote.parked.store(false, Ordering::Release);
}

/// Drops (cancelling) every `Runnable` still owned by this worker once
/// shutdown is underway. Dropping a `Runnable` without running it drops
/// its task's future without polling it again, per spec.md §4.7's
/// "Future drop order: tasks first, then Futures, then Wakers" -- the
/// scheduler-side reference is simply released here.
fn drain_on_shutdown(shared: &Arc<Shared>, index: usize) {
    let remote = &shared.remotes[index];

    // SAFETY: this worker's own loop has just exited; `schedule_local`
    // can no longer target this index once another worker observes a
    // later `CURRENT` state, and this thread is still the one draining.
    let slot = unsafe { &mut *remote.lifo_slot.get() };
    drop(slot.take());

    while remote.queue.pop().is_some() {}

    // Best-effort: every exiting worker races to drain the shared
    // injection queue; popping an entry that "belongs" to a peer's
    // overflow is harmless, it is still cancelled correctly.
    while shared.inject.pop().is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;

    struct NoopWaker;
    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
        fn wake_by_ref(self: &Arc<Self>) {}
    }

    fn noop_waker() -> std::task::Waker {
        std::task::Waker::from(Arc::new(NoopWaker))
    }

    /// With no reactor, `poll_reactor_and_timers` is the only thing that
    /// ever calls `TimerWheel::advance`; if it always reported `false` the
    /// worker loop would fall straight through to `park()` right after a
    /// timer fired and rescheduled a task onto this very worker, parking
    /// forever on work sitting in its own LIFO slot. It must report `true`
    /// whenever `advance` actually fired something.
    #[test]
    fn no_reactor_branch_reports_true_when_a_timer_fires() {
        let (shared, _parkers) = build_shared(1, 256, false, true).unwrap();

        // Nothing due yet: no backstop work to report.
        assert!(!poll_reactor_and_timers(&shared));

        shared
            .timers()
            .unwrap()
            .register(Instant::now(), noop_waker());
        std::thread::sleep(Duration::from_millis(2));

        assert!(
            poll_reactor_and_timers(&shared),
            "a fired timer must be reported so the worker loop re-checks \
             next_task instead of parking on work it just produced itself"
        );
    }

    #[test]
    fn no_reactor_branch_reports_false_when_nothing_fires() {
        let (shared, _parkers) = build_shared(1, 256, false, true).unwrap();
        shared
            .timers()
            .unwrap()
            .register(Instant::now() + Duration::from_secs(60), noop_waker());
        assert!(!poll_reactor_and_timers(&shared));
    }

    /// A single worker with I/O disabled must still drain a timer-backed
    /// task to completion instead of deadlocking on its own LIFO slot: the
    /// exact scenario from the reported bug (`worker_threads(1)`,
    /// `enable_io(false)`, a task that parks on a timer it registers
    /// itself). Exercised through the full run loop via `Runtime`.
    #[test]
    fn single_worker_no_io_runtime_resolves_a_timer_backed_task() {
        use crate::runtime::Builder;
        use std::future::poll_fn;
        use std::task::Poll;

        let rt = Builder::new()
            .worker_threads(1)
            .enable_io(false)
            .build()
            .unwrap();

        // Spawn (rather than drive via `block_on` directly) so the future is
        // polled on the worker thread itself: only then does the timer's
        // waker fire through `schedule_local` on that same worker, the exact
        // path the deadlock above depends on.
        let polls = Arc::new(AtomicUsize::new(0));
        let task = {
            let polls = polls.clone();
            rt.spawn(poll_fn(move |cx| {
                if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                    let shared = current_shared().expect("running inside a worker");
                    shared
                        .timers()
                        .expect("time enabled")
                        .register(Instant::now() + Duration::from_millis(5), cx.waker().clone());
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            }))
            .unwrap()
        };

        rt.block_on(async move { task.await.unwrap() }).unwrap();
    }
}
