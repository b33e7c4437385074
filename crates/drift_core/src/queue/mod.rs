//! Run queues: each worker owns a bounded, Chase-Lev [`local::WorkStealingDeque`],
//! and all workers share one unbounded [`inject::InjectionQueue`] for overflow
//! and for tasks spawned from outside a worker thread.

mod inject;
mod local;

pub(crate) use inject::InjectionQueue;
pub(crate) use local::{Steal, WorkStealingDeque};
