//! Hooks invoked around every task body.
//!
//! Observers run synchronously on the worker executing the task, right before
//! and right after its work. They must be fast and must not block. Tasks that
//! skip their work (cancelled or failed runs) are not reported.

use crate::{task::TaskView, types::IndexMap};
use parking_lot::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

/// Receives task entry/exit notifications from an
/// [`Executor`](crate::executor::Executor).
pub trait Observer: Send + Sync {
    /// Called once when the observer is registered.
    fn set_up(&self, num_workers: usize) {
        let _ = num_workers;
    }

    /// `worker` is about to run `task`.
    fn on_entry(&self, worker: usize, task: &TaskView<'_>);

    /// `worker` finished running `task`, successfully or not.
    fn on_exit(&self, worker: usize, task: &TaskView<'_>);
}

/// Emits a `trace`-level event for every task entry and exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn set_up(&self, num_workers: usize) {
        trace!(num_workers, "tracing observer attached");
    }

    fn on_entry(&self, worker: usize, task: &TaskView<'_>) {
        trace!(
            worker,
            graph = task.graph,
            task = task.name,
            kind = %task.kind,
            priority = %task.priority,
            "task entered"
        );
    }

    fn on_exit(&self, worker: usize, task: &TaskView<'_>) {
        trace!(worker, graph = task.graph, task = task.name, "task exited");
    }
}

/// One task execution on one worker, relative to the observer's creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Worker that ran the task.
    pub worker: usize,
    /// Graph the task belongs to.
    pub graph: String,
    /// Task name.
    pub task: String,
    /// Entry time.
    pub begin: Duration,
    /// Exit time.
    pub end: Duration,
}

impl Segment {
    /// Time spent in the task.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.begin)
    }
}

/// Aggregated executions of one task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
    /// Number of executions.
    pub count: usize,
    /// Sum of execution times.
    pub total: Duration,
    /// Shortest execution.
    pub min: Duration,
    /// Longest execution.
    pub max: Duration,
}

impl TaskSummary {
    /// Mean execution time.
    #[must_use]
    pub fn mean(&self) -> Duration {
        u32::try_from(self.count).map_or(Duration::ZERO, |count| {
            self.total.checked_div(count).unwrap_or_default()
        })
    }
}

#[derive(Debug, Default)]
struct WorkerTimeline {
    /// Entered but not yet exited; nested when a worker co-runs a subflow.
    open: Vec<(String, String, Duration)>,
    segments: Vec<Segment>,
}

/// Records when each task ran on which worker.
#[derive(Debug)]
pub struct TimelineObserver {
    origin: Instant,
    workers: RwLock<Vec<Mutex<WorkerTimeline>>>,
}

impl Default for TimelineObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineObserver {
    /// An empty timeline starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            workers: RwLock::new(Vec::new()),
        }
    }

    /// All finished executions, ordered by entry time.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments: Vec<_> = self
            .workers
            .read()
            .iter()
            .flat_map(|worker| worker.lock().segments.clone())
            .collect();
        segments.sort_by_key(|segment| (segment.begin, segment.worker));
        segments
    }

    /// Per task name, in order of first appearance.
    #[must_use]
    pub fn summary(&self) -> IndexMap<String, TaskSummary> {
        let mut summary = IndexMap::default();
        for segment in self.segments() {
            let duration = segment.duration();
            summary
                .entry(segment.task)
                .and_modify(|entry: &mut TaskSummary| {
                    entry.count += 1;
                    entry.total += duration;
                    entry.min = entry.min.min(duration);
                    entry.max = entry.max.max(duration);
                })
                .or_insert(TaskSummary {
                    count: 1,
                    total: duration,
                    min: duration,
                    max: duration,
                });
        }
        summary
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        for worker in self.workers.read().iter() {
            let mut worker = worker.lock();
            worker.open.clear();
            worker.segments.clear();
        }
    }

    fn with_worker(&self, worker: usize, f: impl FnOnce(&mut WorkerTimeline)) {
        if let Some(timeline) = self.workers.read().get(worker) {
            f(&mut timeline.lock());
        }
    }
}

impl Observer for TimelineObserver {
    fn set_up(&self, num_workers: usize) {
        let mut workers = self.workers.write();
        if workers.len() < num_workers {
            workers.resize_with(num_workers, Mutex::default);
        }
    }

    fn on_entry(&self, worker: usize, task: &TaskView<'_>) {
        let now = self.origin.elapsed();
        self.with_worker(worker, |timeline| {
            timeline
                .open
                .push((task.graph.to_owned(), task.name.to_owned(), now));
        });
    }

    fn on_exit(&self, worker: usize, _task: &TaskView<'_>) {
        let now = self.origin.elapsed();
        self.with_worker(worker, |timeline| {
            if let Some((graph, task, begin)) = timeline.open.pop() {
                timeline.segments.push(Segment {
                    worker,
                    graph,
                    task,
                    begin,
                    end: now,
                });
            }
        });
    }
}
