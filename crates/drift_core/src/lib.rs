//! Scheduler, reactor and timer wheel: the engine [`drift`](../drift/index.html) wraps.
//!
//! Four tightly-coupled parts, one module each:
//!
//! - [`queue`] — the work-stealing local deque and the global injection
//!   queue every worker shares.
//! - [`task`] — the task model, built on `async_task` rather than a
//!   hand-rolled vtable (see that module's docs for why).
//! - [`reactor`] — the I/O readiness event loop.
//! - [`time`] — the hierarchical timer wheel.
//! - [`worker`] — the per-thread run loop and the state shared between
//!   workers and `runtime`.
//! - [`runtime`] — `Builder`, `Runtime`, `Handle`: the public surface that
//!   assembles the above into something a caller can `spawn`/`block_on`.

pub mod error;
mod queue;
pub mod reactor;
pub mod runtime;
pub mod task;
pub mod time;
mod worker;
