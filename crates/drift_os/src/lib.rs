//! Platform primitives shared by the scheduler and reactor.
//!
//! This crate carries no knowledge of tasks or futures. It provides the
//! low-level building blocks the runtime assembles into the work-stealing
//! scheduler: cache-line padding, exponential backoff for spin loops, an
//! unbounded block-recycling MPMC queue, and a park/unpark primitive for
//! idle worker threads.

mod backoff;
mod cache_padded;
mod list_queue;
mod parker;
mod spin_lock;

pub use backoff::Backoff;
pub use cache_padded::CachePadded;
pub use list_queue::ListQueue;
pub use parker::{Parker, Unparker};
pub use spin_lock::{SpinLock, SpinLockGuard};
