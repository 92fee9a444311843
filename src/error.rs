use std::any::Any;
use thiserror::Error;

/// Configuration error reported synchronously, before anything runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// Strong (non-conditional) dependencies form a cycle.
    ///
    /// Only the weak edges leaving a condition task may close a loop.
    #[error("graph `{graph}` contains a cycle of strong dependencies through task `{task}`")]
    Cycle {
        /// Name of the offending graph.
        graph: String,
        /// Name of one task on the cycle.
        task: String,
    },
    /// A non-conditional task was made to precede itself.
    #[error("task `{task}` cannot precede itself")]
    SelfLoop {
        /// Name of the offending task.
        task: String,
    },
    /// A semaphore was created with a limit of zero.
    #[error("semaphore limit must be positive")]
    ZeroSemaphoreLimit,
    /// An executor was configured without workers.
    #[error("executor needs at least one worker")]
    NoWorkers,
    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Failure captured while a graph was running.
///
/// Returned by [`RunHandle::wait`](crate::topology::RunHandle::wait) and
/// [`AsyncHandle::get`](crate::topology::AsyncHandle::get). Only the first
/// failure of a run is kept.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunError {
    /// A task's callable panicked.
    #[error("task `{task}` panicked: {message}")]
    TaskPanicked {
        /// Name of the task.
        task: String,
        /// Panic message, if the payload was a string.
        message: String,
    },
    /// The `run_until` predicate panicked.
    #[error("loop predicate panicked: {message}")]
    PredicatePanicked {
        /// Panic message, if the payload was a string.
        message: String,
    },
    /// A graph was entered while another run of it was still executing.
    #[error("graph `{graph}` is already executing")]
    GraphInUse {
        /// Name of the graph.
        graph: String,
    },
    /// A subflow or module graph failed validation.
    #[error("nested graph is invalid: {0}")]
    InvalidSubgraph(#[from] BuildError),
    /// The run was cancelled before the task produced its result.
    #[error("task was cancelled before producing a result")]
    Cancelled,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
