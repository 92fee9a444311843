mod invoke;
mod worker;

use crate::{
    config::ExecutorConfig,
    error::{BuildError, RunError, panic_message},
    graph::Graph,
    observer::Observer,
    topology::{AsyncHandle, Predicate, RunHandle, Scope, ScopeKind, Topology},
    types::{NodeId, Priority},
};
use core::array;
use crossbeam_deque::{Injector, Stealer, Worker as Deque};
use derive_more::Debug;
use parking_lot::{Condvar, Mutex, RwLock};
use rand::{SeedableRng, rngs::SmallRng};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, warn};
use unzip3::Unzip3;
use worker::Worker;

/// Fixed pool of worker threads executing graphs.
///
/// Key responsibilities:
/// - Owns one thread per worker, each with a local ready queue per priority
///   level; idle workers steal from the global queues first, then from random
///   peers.
/// - Turns each `run*` call into a topology, queued behind earlier runs of
///   the same graph, and resolves its [`RunHandle`] once the last pass
///   drained.
/// - Puts workers to sleep when no work is visible anywhere and wakes one per
///   newly pushed job.
///
/// Dropping the executor waits for every submitted run, then joins the
/// workers.
#[must_use]
#[derive(Debug)]
pub struct Executor {
    shared: Arc<Shared>,
    #[debug(skip)]
    threads: Vec<JoinHandle<()>>,
}

/// A node of a scope, ready to be dispatched.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub(crate) scope: Arc<Scope>,
    pub(crate) node: NodeId,
}

impl Job {
    fn priority(&self) -> Priority {
        self.scope.graph.node(self.node).priority
    }
}

/// State reachable from every worker.
#[derive(Debug)]
pub(crate) struct Shared {
    config: ExecutorConfig,
    /// Global overflow queues, one per priority level.
    #[debug(skip)]
    injectors: [Injector<Job>; 3],
    /// `stealers[w][p]` steals from the priority-`p` queue of worker `w`.
    #[debug(skip)]
    stealers: Vec<[Stealer<Job>; 3]>,
    idle: Mutex<IdleState>,
    #[debug(skip)]
    wake: Condvar,
    #[debug(skip)]
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    /// Submitted runs that haven't resolved yet.
    active: Mutex<usize>,
    #[debug(skip)]
    drained: Condvar,
}

#[derive(Debug, Default)]
struct IdleState {
    sleeping: usize,
    shutdown: bool,
}

impl Executor {
    /// Start `config.num_workers` worker threads.
    ///
    /// # Errors
    /// [`BuildError::NoWorkers`] for an empty pool, [`BuildError::Spawn`] if
    /// a thread could not be started.
    pub fn new(config: ExecutorConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let mut seeder = SmallRng::seed_from_u64(config.seed);
        let (queues, stealers, rngs): (Vec<_>, Vec<_>, Vec<_>) = (0..config.num_workers)
            .map(|_| {
                let queues: [Deque<Job>; 3] = array::from_fn(|_| Deque::new_lifo());
                let stealers = queues.each_ref().map(Deque::stealer);
                (queues, stealers, SmallRng::from_rng(&mut seeder))
            })
            .unzip3();

        let steal_bound = config.effective_steal_bound();
        let shared = Arc::new(Shared {
            config,
            injectors: array::from_fn(|_| Injector::new()),
            stealers,
            idle: Mutex::new(IdleState::default()),
            wake: Condvar::new(),
            observers: RwLock::new(Vec::new()),
            active: Mutex::new(0),
            drained: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(queues.len());
        for (id, (queues, rng)) in queues.into_iter().zip(rngs).enumerate() {
            let worker = Worker::new(id, shared.clone(), queues, rng, steal_bound);
            let spawned = thread::Builder::new()
                .name(format!("{}-{id}", shared.config.thread_name))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    shared.shutdown();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(BuildError::Spawn(err.to_string()));
                }
            }
        }
        debug!(num_workers = threads.len(), "executor started");
        Ok(Self { shared, threads })
    }

    /// Executor with `num_workers` workers and default settings otherwise.
    ///
    /// # Errors
    /// See [`new`](Self::new).
    pub fn with_workers(num_workers: usize) -> Result<Self, BuildError> {
        Self::new(ExecutorConfig::with_workers(num_workers))
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Runs submitted and not yet resolved.
    #[must_use]
    pub fn num_topologies(&self) -> usize {
        *self.shared.active.lock()
    }

    /// Run `graph` once.
    ///
    /// # Errors
    /// [`BuildError::Cycle`] if the graph has a strong cycle; nothing is
    /// scheduled then.
    pub fn run(&self, graph: impl Into<Arc<Graph>>) -> Result<RunHandle, BuildError> {
        self.run_n(graph, 1)
    }

    /// Run `graph` `n` times; each pass starts after the previous one drained.
    ///
    /// # Errors
    /// See [`run`](Self::run).
    pub fn run_n(&self, graph: impl Into<Arc<Graph>>, n: usize) -> Result<RunHandle, BuildError> {
        let graph = graph.into();
        graph.validate()?;
        Ok(self.submit(graph, Topology::countdown(n)))
    }

    /// Run `graph` repeatedly until `stop` returns `true`.
    ///
    /// `stop` is evaluated before every pass, including the first. A panic in
    /// `stop` ends the run with [`RunError::PredicatePanicked`].
    ///
    /// # Errors
    /// See [`run`](Self::run).
    pub fn run_until(
        &self,
        graph: impl Into<Arc<Graph>>,
        stop: impl FnMut() -> bool + Send + 'static,
    ) -> Result<RunHandle, BuildError> {
        let graph = graph.into();
        graph.validate()?;
        Ok(self.submit(graph, Box::new(stop)))
    }

    /// Run `work` on the pool and hand back its result.
    pub fn run_async<T, F>(&self, work: F) -> AsyncHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let output = slot.clone();
        let mut work = Some(work);
        let mut graph = Graph::new("async");
        graph.emplace(move || {
            if let Some(work) = work.take() {
                *output.lock() = Some(work());
            }
        });
        let run = self.submit(Arc::new(graph), Topology::countdown(1));
        AsyncHandle::new(run, slot)
    }

    /// Run `work` on the pool without keeping a handle.
    pub fn spawn_detached(&self, work: impl FnOnce() + Send + 'static) {
        drop(self.run_async(work));
    }

    /// Block until every submitted run resolved.
    ///
    /// Must not be called from inside a task.
    pub fn wait_for_all(&self) {
        let mut active = self.shared.active.lock();
        while *active != 0 {
            self.shared.drained.wait(&mut active);
        }
    }

    /// Register an observer for all subsequently dispatched tasks.
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        observer.set_up(self.num_workers());
        self.shared.observers.write().push(observer);
    }

    /// Unregister every observer.
    pub fn clear_observers(&self) {
        self.shared.observers.write().clear();
    }

    fn submit(&self, graph: Arc<Graph>, stop: Predicate) -> RunHandle {
        let topology = Topology::new(graph, stop, self.shared.config.halt_on_panic);
        self.shared.submit(&topology);
        RunHandle::new(topology)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.wait_for_all();
        self.shared.shutdown();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("executor stopped");
    }
}

impl Shared {
    fn submit(&self, topology: &Arc<Topology>) {
        *self.active.lock() += 1;
        let first = {
            let mut runs = topology.graph.runs.lock();
            runs.push_back(topology.clone());
            runs.len() == 1
        };
        if first {
            self.begin(topology);
        }
    }

    /// Start a topology that reached the head of its graph's queue.
    fn begin(&self, topology: &Arc<Topology>) {
        let graph = &topology.graph;
        if !graph.try_enter() {
            warn!(graph = graph.name(), "graph is executing as a module; run rejected");
            topology.fail(RunError::GraphInUse {
                graph: graph.name().to_owned(),
            });
            self.retire(topology, false);
            return;
        }
        debug!(graph = graph.name(), nodes = graph.len(), "topology started");
        self.drive(topology);
    }

    /// Start passes until one is in flight or the run is over.
    fn drive(&self, topology: &Arc<Topology>) {
        loop {
            if !topology.next_pass() {
                self.retire(topology, true);
                return;
            }
            if self.start_pass(topology) {
                return;
            }
            // Nothing to schedule: the pass is complete already.
            topology.complete_pass();
        }
    }

    /// Called by the worker that drained the root scope of a pass.
    fn finish_pass(&self, topology: &Arc<Topology>) {
        topology.complete_pass();
        self.drive(topology);
    }

    fn start_pass(&self, topology: &Arc<Topology>) -> bool {
        let graph = &topology.graph;
        let sources = match graph.plan() {
            Ok(plan) => &plan.sources,
            Err(err) => {
                topology.fail(err.into());
                return false;
            }
        };
        if sources.is_empty() {
            return false;
        }
        graph.arm();
        let scope = Scope::new(graph.clone(), topology.clone(), ScopeKind::Root);
        scope.pending.add(sources.len());
        self.push_global(sources.iter().map(|&node| Job {
            scope: scope.clone(),
            node,
        }));
        true
    }

    /// Push jobs onto the global queues and wake workers to take them.
    fn push_global(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut pushed = 0;
        for job in jobs {
            self.injectors[job.priority().index()].push(job);
            pushed += 1;
        }
        if pushed != 0 {
            self.notify(pushed);
        }
    }

    /// Resolve a finished topology and start the next run of its graph.
    fn retire(&self, topology: &Arc<Topology>, entered: bool) {
        let graph = &topology.graph;
        if entered {
            graph.leave();
        }
        let next = {
            let mut runs = graph.runs.lock();
            let head = runs.pop_front();
            assert!(
                head.is_some_and(|head| Arc::ptr_eq(&head, topology)),
                "Shared::retire: [1]"
            );
            runs.front().cloned()
        };
        let held = topology.take_held();
        if !topology.is_clean() {
            // Permits taken by nodes whose releasing counterpart never ran.
            for (semaphore, count) in held {
                debug!(graph = graph.name(), count, "returning permits of a stopped run");
                self.push_global((0..count).flat_map(|_| semaphore.release()));
            }
        }
        debug!(
            graph = graph.name(),
            passes = topology.passes(),
            cancelled = topology.is_cancelled(),
            "topology finished"
        );
        topology.resolve();
        {
            let mut active = self.active.lock();
            *active -= 1;
            if *active == 0 {
                self.drained.notify_all();
            }
        }
        if let Some(next) = next {
            self.begin(&next);
        }
    }

    /// Wake up to `pushed` sleeping workers.
    fn notify(&self, pushed: usize) {
        let idle = self.idle.lock();
        for _ in 0..pushed.min(idle.sleeping) {
            self.wake.notify_one();
        }
    }

    /// Whether any queue a worker could take from is non-empty.
    fn has_visible_work(&self) -> bool {
        self.injectors.iter().any(|injector| !injector.is_empty())
            || self
                .stealers
                .iter()
                .flatten()
                .any(|stealer| !stealer.is_empty())
    }

    fn shutdown(&self) {
        self.idle.lock().shutdown = true;
        self.wake.notify_all();
    }

    /// Call `f` on every observer. A panicking observer is logged and
    /// skipped; it never takes the worker down.
    fn observe(&self, f: impl Fn(&dyn Observer)) {
        for observer in self.observers.read().iter() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))) {
                let message = panic_message(payload.as_ref());
                warn!(%message, "observer panicked");
            }
        }
    }
}
