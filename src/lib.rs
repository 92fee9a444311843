//! Work-stealing executor for graphs of dependent tasks.
//!
//! A [`Graph`] is an arena of nodes connected by edges; an [`Executor`] runs
//! it on a fixed pool of worker threads so that every node runs only after
//! all of its predecessors completed. On top of plain dependencies it offers:
//! - Condition tasks, whose return value selects a single successor. Their
//!   edges are weak and may point back to an ancestor, which is how loops are
//!   expressed.
//! - Subflow tasks, which build a nested graph at run time, either joined
//!   (the task completes after the nested graph) or detached.
//! - Module tasks, which run another graph to completion as a nested run.
//! - Priorities among the nodes ready on one worker.
//! - Semaphores bounding how many of a set of nodes run at once.
//! - Repeated runs (`run_n`, `run_until`) and one-off background work
//!   (`run_async`).
//!
//! Key modules:
//! - `graph`: the node arena, edge bookkeeping and cycle validation.
//! - `executor`: worker threads, the per-priority ready queues, stealing,
//!   sleeping, and the submission API.
//! - `topology`: one submitted run, its cancellation/failure state and the
//!   handles callers wait on.
//! - `semaphore`: permit counting with parked waiters.
//! - `observer`: hooks invoked around every task body.
//!
//! Quick start:
//! 1. Build a [`Graph`] with `emplace*` and link nodes with `precede`.
//! 2. Create an [`Executor`] and call `run` with the graph.
//! 3. `wait` on the returned [`RunHandle`]; a panic inside any task surfaces
//!    there as [`RunError::TaskPanicked`].
//!
// Loom atomics panic outside a model, so the example only runs without it.
#![cfg_attr(not(feature = "loom"), doc = "```")]
#![cfg_attr(feature = "loom", doc = "```ignore")]
//! use std::sync::{
//!     Arc,
//!     atomic::{AtomicUsize, Ordering},
//! };
//! use taskweave::{Executor, Graph, Outcome};
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let mut graph = Graph::new("demo");
//! let [a, b] = [(); 2].map(|()| {
//!     let counter = counter.clone();
//!     graph.emplace(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })
//! });
//! graph.precede(a, b).unwrap();
//!
//! let executor = Executor::with_workers(2).unwrap();
//! let outcome = executor.run_n(graph, 3).unwrap().wait();
//! assert_eq!(outcome, Ok(Outcome::Completed));
//! assert_eq!(counter.load(Ordering::Relaxed), 6);
//! ```

/// Executor settings and their environment overrides.
pub mod config;
/// Configuration and run-time failures.
pub mod error;
/// The worker pool and the submission API.
///
/// Each worker owns one LIFO queue per priority level. Idle workers steal in
/// batches from the global per-priority queues, then from a randomly chosen
/// peer, and go to sleep on a condition variable after a bounded number of
/// fruitless rounds. Every push wakes at most one sleeper per pushed job.
pub mod executor;
/// Graph construction and validation.
pub mod graph;
/// Task observers.
pub mod observer;
/// Concurrency limiting across nodes.
pub mod semaphore;
mod sync;
/// Units of work carried by nodes.
pub mod task;
/// Runs of a graph and their completion handles.
pub mod topology;
/// Handles, priorities and counters shared across the crate.
pub mod types;

pub use config::ExecutorConfig;
pub use error::{BuildError, RunError};
pub use executor::Executor;
pub use graph::Graph;
pub use observer::{Observer, TimelineObserver, TracingObserver};
pub use semaphore::{CriticalSection, Semaphore, SemaphoreMode};
pub use task::{Subflow, TaskKind, TaskView, Work};
pub use topology::{AsyncHandle, Outcome, RunHandle};
pub use types::{NodeId, Priority};
