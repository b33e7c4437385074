use std::fmt;

/// Errors the runtime itself can produce, as opposed to errors produced by
/// user futures.
///
/// Every variant here corresponds to one row of the error taxonomy: a
/// config rejection, a lifecycle violation, or a reactor failure. None of
/// these represent a task panic — that is reported through [`JoinError`]
/// on the task's own `JoinHandle`, not through this type.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// `Builder::build` was called with contradictory configuration, e.g.
    /// `worker_threads == 0` or a non-power-of-two `queue_capacity`.
    #[error("invalid runtime configuration: {0}")]
    ConfigInvalid(String),

    /// `spawn`/`Handle::spawn` was called after shutdown began.
    #[error("spawn called after runtime shutdown")]
    SpawnAfterShutdown,

    /// `block_on` was called from inside a worker thread. Nested block_on
    /// would deadlock the calling worker against itself, so it is rejected
    /// instead.
    #[error("block_on called from within a runtime worker thread")]
    NestedBlockOn,

    /// The polling backend rejected a source registration (bad descriptor,
    /// resource exhaustion).
    #[error("failed to register I/O source: {0}")]
    ReactorRegister(#[source] std::io::Error),

    /// The polling backend returned an error it cannot recover from; the
    /// reactor is marked failed and the runtime begins shutting down.
    #[error("reactor poll failed: {0}")]
    ReactorPoll(#[source] std::io::Error),
}

/// The outcome of awaiting a [`JoinHandle`](crate::task::JoinHandle) whose
/// task did not produce a value normally.
#[derive(Debug)]
pub enum JoinError {
    /// The task was aborted via `JoinHandle::abort` before it completed.
    Cancelled,
    /// The task's future panicked during `poll`.
    Panicked(Box<dyn std::any::Any + Send + 'static>),
}

impl JoinError {
    /// Returns `true` if the task was cancelled rather than panicking.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }

    /// Returns `true` if the task panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panicked(_))
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    /// Panics if this is [`JoinError::Cancelled`] rather than a real panic.
    pub fn into_panic(self) -> Box<dyn std::any::Any + Send + 'static> {
        match self {
            JoinError::Panicked(payload) => payload,
            JoinError::Cancelled => panic!("called `JoinError::into_panic` on a cancelled task"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("task was cancelled"),
            JoinError::Panicked(_) => f.write_str("task panicked"),
        }
    }
}

impl std::error::Error for JoinError {}
