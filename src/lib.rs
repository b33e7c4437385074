//! `drift` is the core of a multi-threaded, work-stealing asynchronous
//! runtime: a task scheduler, an I/O reactor and a hierarchical timer wheel.
//!
//! This crate is a thin facade over [`drift_core`], which does the actual
//! work. Most applications only need the re-exports here:
//!
//! ```no_run
//! use drift::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! rt.block_on(async {
//!     let handle = drift::spawn(async { 1 + 1 });
//!     assert_eq!(handle.await.unwrap(), 2);
//! }).unwrap();
//! ```
//!
//! The runtime does not provide networking types, synchronization
//! primitives, or a CLI; those are built on top of the [`Handle`],
//! [`Registration`] and timer primitives this crate exposes.

use std::future::Future;

pub use drift_core::error::{JoinError, RuntimeError};
pub use drift_core::reactor::{Interest, Registration};
pub use drift_core::runtime::{Builder, Handle, Runtime};
pub use drift_core::task::JoinHandle;
pub use drift_core::time::TimerHandle;

/// Spawns a future onto the current thread's runtime.
///
/// # Panics
/// Panics if called outside the context of a [`Runtime`] worker thread or
/// [`Runtime::block_on`]. Prefer [`Handle::spawn`] when a `Handle` is
/// already at hand.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    drift_core::runtime::spawn(future)
}
