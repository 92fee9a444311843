//! One submitted run of a graph and the handles its caller waits on.

use crate::{
    error::{RunError, panic_message},
    graph::Graph,
    semaphore::Semaphore,
    types::JoinCounter,
};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use derive_more::Debug;
use parking_lot::{Condvar, Mutex};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::{Duration, Instant},
};

const CLEAN: u8 = 0;
const CANCELLED: u8 = 1;
const EXCEPTION: u8 = 2;

/// How a run that didn't fail ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every pass ran to completion.
    Completed,
    /// The run was cancelled; the nodes dispatched afterwards skipped their
    /// work.
    Cancelled,
}

pub(crate) type Predicate = Box<dyn FnMut() -> bool + Send>;

/// One invocation of a graph: possibly several passes, one completion.
#[derive(Debug)]
pub(crate) struct Topology {
    pub(crate) graph: Arc<Graph>,
    /// `CLEAN`, `CANCELLED` or `EXCEPTION`.
    state: AtomicU8,
    halt_on_panic: bool,
    #[debug(skip)]
    error: Mutex<Option<RunError>>,
    /// Evaluated before every pass; `true` ends the run.
    #[debug(skip)]
    stop: Mutex<Predicate>,
    passes: AtomicUsize,
    /// Permits taken by acquire-only nodes and not yet returned by a
    /// release-only node.
    #[debug(skip)]
    held: Mutex<Vec<(Semaphore, usize)>>,
    #[debug(skip)]
    result: Mutex<Option<Result<Outcome, RunError>>>,
    #[debug(skip)]
    resolved: Condvar,
}

impl Topology {
    pub(crate) fn new(graph: Arc<Graph>, stop: Predicate, halt_on_panic: bool) -> Arc<Self> {
        Arc::new(Self {
            graph,
            state: AtomicU8::new(CLEAN),
            halt_on_panic,
            error: Mutex::new(None),
            stop: Mutex::new(stop),
            passes: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            resolved: Condvar::new(),
        })
    }

    /// Predicate that ends the run after `n` passes.
    pub(crate) fn countdown(mut n: usize) -> Predicate {
        Box::new(move || {
            if n == 0 {
                return true;
            }
            n -= 1;
            false
        })
    }

    pub(crate) fn cancel(&self) -> bool {
        !self.is_finished()
            && self
                .state
                .compare_exchange(CLEAN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Keep the first failure and flip a clean run into the exception state.
    /// A cancelled run stays cancelled.
    pub(crate) fn fail(&self, error: RunError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        let _ = self
            .state
            .compare_exchange(CLEAN, EXCEPTION, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Whether the run was neither cancelled nor failed so far.
    pub(crate) fn is_clean(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLEAN
    }

    /// Record a permit taken by a node that doesn't return it itself.
    pub(crate) fn hold(&self, semaphore: &Semaphore) {
        let mut held = self.held.lock();
        match held.iter_mut().find(|(held, _)| held.ptr_eq(semaphore)) {
            Some((_, count)) => *count += 1,
            None => held.push((semaphore.clone(), 1)),
        }
    }

    /// Settle one held permit of `semaphore`. Returns `false` if this run
    /// holds none.
    pub(crate) fn unhold(&self, semaphore: &Semaphore) -> bool {
        let mut held = self.held.lock();
        let Some(idx) = held.iter().position(|(held, _)| held.ptr_eq(semaphore)) else {
            return false;
        };
        held[idx].1 -= 1;
        if held[idx].1 == 0 {
            held.swap_remove(idx);
        }
        true
    }

    /// Forget every held permit, returning them with their counts.
    pub(crate) fn take_held(&self) -> Vec<(Semaphore, usize)> {
        core::mem::take(&mut *self.held.lock())
    }

    /// Whether a node dispatched now must skip its work.
    pub(crate) fn should_skip(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLEAN => false,
            CANCELLED => true,
            _ => self.halt_on_panic,
        }
    }

    /// Decide whether another pass starts.
    pub(crate) fn next_pass(&self) -> bool {
        if self.state.load(Ordering::Acquire) != CLEAN {
            return false;
        }
        let mut stop = self.stop.lock();
        match catch_unwind(AssertUnwindSafe(|| stop())) {
            Ok(stop) => !stop,
            Err(payload) => {
                self.fail(RunError::PredicatePanicked {
                    message: panic_message(payload.as_ref()),
                });
                false
            }
        }
    }

    pub(crate) fn complete_pass(&self) -> usize {
        self.passes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn passes(&self) -> usize {
        self.passes.load(Ordering::Acquire)
    }

    /// Fulfil the promise. Called once, after the last pass drained.
    pub(crate) fn resolve(&self) {
        let outcome = match self.error.lock().clone() {
            Some(error) => Err(error),
            None if self.is_cancelled() => Ok(Outcome::Cancelled),
            None => Ok(Outcome::Completed),
        };
        let mut result = self.result.lock();
        assert!(result.is_none(), "Topology::resolve: [1]");
        *result = Some(outcome);
        self.resolved.notify_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.result.lock().is_some()
    }

    fn wait(&self) -> Result<Outcome, RunError> {
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            self.resolved.wait(&mut result);
        }
    }

    fn wait_until(&self, deadline: Instant) -> Option<Result<Outcome, RunError>> {
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return Some(outcome.clone());
            }
            if self.resolved.wait_until(&mut result, deadline).timed_out() {
                return result.clone();
            }
        }
    }
}

/// Where a scope reports when it drains.
#[derive(Debug)]
pub(crate) enum ScopeKind {
    /// A pass of the topology's own graph.
    Root,
    /// A subflow or module graph some worker co-runs until it drains.
    Joined,
    /// A detached subflow graph, counted as one job of its parent scope.
    Detached(Arc<Scope>),
}

/// One pass of one graph inside a topology.
#[derive(Debug)]
pub(crate) struct Scope {
    pub(crate) graph: Arc<Graph>,
    pub(crate) topology: Arc<Topology>,
    /// Jobs scheduled in this scope that haven't finished yet.
    pub(crate) pending: JoinCounter,
    pub(crate) kind: ScopeKind,
}

impl Scope {
    pub(crate) fn new(graph: Arc<Graph>, topology: Arc<Topology>, kind: ScopeKind) -> Arc<Self> {
        Arc::new(Self {
            graph,
            topology,
            pending: JoinCounter::new(0),
            kind,
        })
    }
}

/// Handle to a submitted run; the caller's side of its completion promise.
///
/// Dropping the handle doesn't cancel the run.
#[must_use]
#[derive(Debug, Clone)]
pub struct RunHandle {
    topology: Arc<Topology>,
}

impl RunHandle {
    pub(crate) fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    /// Block until the run resolved.
    ///
    /// Must not be called from inside a task of the same executor: the
    /// blocked worker would be lost to the run it waits for.
    ///
    /// # Errors
    /// The first failure captured during the run.
    pub fn wait(&self) -> Result<Outcome, RunError> {
        self.topology.wait()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Outcome, RunError>> {
        self.topology.wait_until(Instant::now() + timeout)
    }

    /// Whether the run resolved.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.topology.is_finished()
    }

    /// Request cancellation. Running nodes finish; nodes dispatched afterwards
    /// skip their work, and the run still resolves.
    ///
    /// Returns `false` if the run already finished, failed or was cancelled.
    pub fn cancel(&self) -> bool {
        self.topology.cancel()
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.topology.is_cancelled()
    }

    /// Passes completed so far.
    #[must_use]
    pub fn passes(&self) -> usize {
        self.topology.passes()
    }
}

/// Handle to a value computed by a detached task.
#[must_use]
#[derive(Debug)]
pub struct AsyncHandle<T> {
    run: RunHandle,
    #[debug(skip)]
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> AsyncHandle<T> {
    pub(crate) fn new(run: RunHandle, slot: Arc<Mutex<Option<T>>>) -> Self {
        Self { run, slot }
    }

    /// Block until the task finished and take its value.
    ///
    /// # Errors
    /// [`RunError::TaskPanicked`] if the task panicked,
    /// [`RunError::Cancelled`] if it was cancelled before it ran.
    pub fn get(self) -> Result<T, RunError> {
        self.run.wait()?;
        self.slot.lock().take().ok_or(RunError::Cancelled)
    }

    /// Whether the task finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.run.is_finished()
    }

    /// Request cancellation; see [`RunHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.run.cancel()
    }
}
