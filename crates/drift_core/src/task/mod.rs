//! The task model: a heap-allocated, reference-counted handle wrapping a
//! future, built on top of [`async_task`] rather than a hand-rolled vtable.
//!
//! `async_task` already provides the refcounted, type-erased,
//! waker-integrated task representation (state word, poll/drop vtable,
//! NOTIFIED-bit handling for "wake during poll") that a runtime like this
//! would otherwise have to hand-roll as unsafe code. [`JoinTask`] adds only
//! what `async_task::Task` does not: a stable [`TaskId`], panic capture via
//! [`JoinError::Panicked`], and drop-detaches semantics for the public
//! [`JoinHandle`].

mod join;
mod xor_shift;

pub use join::{JoinHandle, TaskId};
pub(crate) use join::JoinTask;
pub(crate) use xor_shift::XorShift64Star;

use std::future::Future;

use async_task::Runnable;

/// Wraps `future` for scheduling and returns the [`Runnable`] the scheduler
/// drives plus the [`JoinHandle`] the caller observes.
///
/// `schedule` is invoked by `async_task` whenever the task becomes runnable
/// (on first spawn, and every time a waker fires); it is the scheduler's
/// only integration point with the task model; everything else (state
/// word, NOTIFIED bit, refcounting) is handled internally by `async_task`.
pub(crate) fn spawn<F, S>(future: F, schedule: S) -> (Runnable, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Fn(Runnable) + Send + Sync + 'static,
{
    let (body, handle) = join::wrap(future);
    let (runnable, task) = async_task::spawn(body, schedule);
    // The public JoinHandle, not `async_task::Task`, is what observes the
    // result; detach immediately so dropping the JoinHandle cannot cancel
    // the underlying async_task::Task (that would break the "drop detaches"
    // contract: the task must keep running even if its JoinHandle is gone).
    task.detach();
    (runnable, handle)
}
