//! Counting limiter for a subset of nodes.
//!
//! A node that fails to take a permit is not retried by spinning: it is parked
//! on the semaphore's waiter list and leaves the worker. The node that later
//! returns a permit drains the whole list and hands the parked nodes back to
//! the scheduler, where they try again.

use crate::{error::BuildError, executor::Job, graph::Graph, sync::Mutex, types::NodeId};
use core::fmt;
use std::sync::Arc;

/// How a node interacts with a [`Semaphore`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SemaphoreMode {
    /// Take a permit before the node's work runs.
    Acquire,
    /// Return a permit after the node's work ran.
    Release,
    /// Take a permit before and return it after.
    Both,
}

impl SemaphoreMode {
    pub(crate) fn acquires(self) -> bool {
        matches!(self, Self::Acquire | Self::Both)
    }

    pub(crate) fn releases(self) -> bool {
        matches!(self, Self::Release | Self::Both)
    }
}

/// Bounds how many of the nodes attached to it run at the same time.
///
/// Cloning yields another handle to the same permits.
#[derive(Debug, Clone)]
pub struct Semaphore(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    limit: usize,
    permits: Permits<Job>,
}

impl Semaphore {
    /// # Errors
    /// [`BuildError::ZeroSemaphoreLimit`] if `limit` is zero.
    pub fn new(limit: usize) -> Result<Self, BuildError> {
        if limit == 0 {
            return Err(BuildError::ZeroSemaphoreLimit);
        }
        Ok(Self(Arc::new(Inner {
            limit,
            permits: Permits::new(limit),
        })))
    }

    /// The number of permits the semaphore was created with.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.0.limit
    }

    /// Permits currently not taken.
    #[must_use]
    pub fn available(&self) -> usize {
        self.0.permits.available()
    }

    /// Take a permit for `job`, or park it and return `false`.
    pub(crate) fn acquire(&self, job: &Job) -> bool {
        self.0.permits.acquire(|| job.clone())
    }

    /// Return a permit; the caller must reschedule every returned job.
    #[must_use]
    pub(crate) fn release(&self) -> Vec<Job> {
        self.0.permits.release()
    }

    /// Whether both handles share the same permits.
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Permit counter plus FIFO list of parked waiters.
pub(crate) struct Permits<W> {
    state: Mutex<PermitState<W>>,
}

struct PermitState<W> {
    available: usize,
    waiters: Vec<W>,
}

impl<W> Permits<W> {
    pub(crate) fn new(available: usize) -> Self {
        Self {
            state: Mutex::new(PermitState {
                available,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Decrement the counter if positive, otherwise append `waiter()` to the
    /// waiter list. Returns whether a permit was taken.
    pub(crate) fn acquire(&self, waiter: impl FnOnce() -> W) -> bool {
        let mut state = self.state.lock();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            state.waiters.push(waiter());
            false
        }
    }

    /// Increment the counter and hand over every parked waiter.
    pub(crate) fn release(&self) -> Vec<W> {
        let mut state = self.state.lock();
        state.available += 1;
        core::mem::take(&mut state.waiters)
    }
}

impl<W> fmt::Debug for Permits<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Permits")
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Limits a set of nodes to at most `limit` running at a time.
///
/// Every node added takes a permit before its work and returns it after.
#[derive(Debug, Clone)]
pub struct CriticalSection {
    semaphore: Semaphore,
}

impl CriticalSection {
    /// # Errors
    /// [`BuildError::ZeroSemaphoreLimit`] if `limit` is zero.
    pub fn new(limit: usize) -> Result<Self, BuildError> {
        Semaphore::new(limit).map(|semaphore| Self { semaphore })
    }

    /// Put `id` of `graph` into the section.
    pub fn add(&self, graph: &mut Graph, id: NodeId) {
        graph.add_semaphore(id, &self.semaphore, SemaphoreMode::Both);
    }

    /// Put each of `ids` into the section.
    pub fn add_all(&self, graph: &mut Graph, ids: &[NodeId]) {
        for &id in ids {
            self.add(graph, id);
        }
    }

    /// The semaphore guarding the section.
    #[must_use]
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::Permits;
    use loom::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn loom_permits_bound_concurrency_and_hand_over_waiters() {
        loom::model(|| {
            // Two contenders, one permit. A contender that fails parks its id;
            // the holder's release must hand that id back so nobody is lost.
            let permits = Arc::new(Permits::new(1));
            let running = Arc::new(AtomicUsize::new(0));
            let completed = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..2)
                .map(|id| {
                    let permits = permits.clone();
                    let running = running.clone();
                    let completed = completed.clone();
                    loom::thread::spawn(move || -> Vec<usize> {
                        if !permits.acquire(|| id) {
                            return Vec::new();
                        }
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        running.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                        permits.release()
                    })
                })
                .collect();
            let mut handed_over: Vec<usize> = handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect();

            // Rescheduled waiters retry.
            while let Some(id) = handed_over.pop() {
                assert!(permits.acquire(|| id));
                completed.fetch_add(1, Ordering::SeqCst);
                handed_over.extend(permits.release());
            }

            assert_eq!(completed.load(Ordering::SeqCst), 2);
            assert_eq!(permits.available(), 1);
        });
    }
}
