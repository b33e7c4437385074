//! Graceful shutdown under load: a pool full of tasks that never complete
//! on their own must still be fully cancelled, and every one of their
//! futures must actually run its destructor — within the timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use drift_core::runtime::Builder;

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Never resolves on its own; relies entirely on the scheduler dropping
/// it (without polling again) once shutdown begins.
struct NeverReady {
    _marker: DropCounter,
}

impl Future for NeverReady {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Pending
    }
}

#[test]
fn shutdown_timeout_cancels_every_outstanding_task_and_drops_its_future() {
    const TASKS: usize = 100;

    let mut rt = Builder::new().worker_threads(4).build().unwrap();
    let dropped = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            rt.spawn(NeverReady {
                _marker: DropCounter(dropped.clone()),
            })
            .unwrap()
        })
        .collect();

    // Give every worker a chance to actually poll each task once, so it
    // is genuinely parked (Pending, no further wake pending) rather than
    // still sitting unpolled in a queue when shutdown begins.
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    rt.shutdown_timeout(Duration::from_millis(100));
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(500),
        "shutdown_timeout blocked for {elapsed:?}, well past its 100ms budget"
    );
    assert_eq!(
        dropped.load(Ordering::SeqCst),
        TASKS,
        "every pending future must be dropped once shutdown drains its queue"
    );

    drop(handles);
}

#[test]
fn shutdown_background_detaches_without_waiting() {
    let mut rt = Builder::new().worker_threads(2).build().unwrap();
    let dropped = Arc::new(AtomicUsize::new(0));

    let _handle = rt
        .spawn(NeverReady {
            _marker: DropCounter(dropped.clone()),
        })
        .unwrap();

    let start = Instant::now();
    rt.shutdown_background();
    assert!(
        start.elapsed() < Duration::from_millis(20),
        "shutdown_background must return immediately"
    );

    let err = rt.spawn(async {}).unwrap_err();
    assert!(matches!(
        err,
        drift_core::error::RuntimeError::SpawnAfterShutdown
    ));
}
