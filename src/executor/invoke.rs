use super::{Job, worker::Worker};
use crate::{
    error::{RunError, panic_message},
    graph::{Graph, Node},
    semaphore::Semaphore,
    task::{Subflow, Work},
    topology::{Scope, ScopeKind, Topology},
    types::NodeId,
};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::warn;

/// What a node's work asked for once its callable returned.
enum Step {
    Done,
    Branch(usize),
    Subflow(Subflow),
    Module(Arc<Graph>),
}

impl Worker {
    /// Dispatch one job: run its work (unless the run is cancelled or failed),
    /// then release successors and retire the job from its scope.
    ///
    /// ```text
    ///   acquire permits ──► run work ──► release permits ──► successors ──► finish
    ///        │
    ///        └── no permit: parked on the semaphore, still pending in its scope
    /// ```
    pub(super) fn invoke(&mut self, job: Job) {
        let scope = job.scope.clone();
        let node = scope.graph.node(job.node);
        let skip = scope.topology.should_skip();
        if !skip && !self.acquire_all(&job, node) {
            return;
        }
        // Re-arm before anything can release this node again, so conditional
        // loops re-trigger it.
        node.join_counter.arm(node.num_strong_preds);

        let step = if skip { Step::Done } else { self.execute(&job) };
        self.release_all(&scope.topology, node, skip);

        let graph = &scope.graph;
        let ready: Vec<NodeId> = match step {
            Step::Branch(branch) => node
                .weak_dependents
                .get(branch)
                .inspect(|&&next| graph.node(next).join_counter.arm(0))
                .copied()
                .into_iter()
                .collect(),
            _ => node
                .strong_dependents
                .iter()
                .copied()
                .filter(|&next| graph.node(next).join_counter.release())
                .collect(),
        };
        scope.pending.add(ready.len());
        self.schedule(ready.into_iter().map(|node| Job {
            scope: scope.clone(),
            node,
        }));
        self.finish(&scope);
    }

    /// Take every permit the node needs, in order. On the first refusal the
    /// job is parked and the permits already taken are given back.
    ///
    /// Permits the node keeps past its own work are recorded on the run, so
    /// they can be returned if the node meant to return them never runs.
    fn acquire_all(&self, job: &Job, node: &Node) -> bool {
        for (taken, semaphore) in node.acquires.iter().enumerate() {
            if !semaphore.acquire(job) {
                self.schedule(node.acquires[..taken].iter().flat_map(Semaphore::release));
                return false;
            }
        }
        for semaphore in &node.acquires {
            if !contains(&node.releases, semaphore) {
                job.scope.topology.hold(semaphore);
            }
        }
        true
    }

    /// Return the node's permits and reschedule everything parked on them.
    ///
    /// A skipped node took nothing itself, but still returns the permits an
    /// earlier node of the run handed over to it.
    fn release_all(&self, topology: &Topology, node: &Node, skip: bool) {
        let released = node.releases.iter().filter(|&semaphore| {
            if contains(&node.acquires, semaphore) {
                !skip
            } else {
                topology.unhold(semaphore) || !skip
            }
        });
        self.schedule(released.flat_map(Semaphore::release));
    }

    fn execute(&mut self, job: &Job) -> Step {
        let Job { scope, node: id } = job;
        let graph = &scope.graph;
        let topology = &scope.topology;
        let view = graph.view(*id);
        let worker = self.id;
        self.shared.observe(|observer| observer.on_entry(worker, &view));

        let step = {
            let mut work = graph.node(*id).work.lock();
            let result = catch_unwind(AssertUnwindSafe(|| match &mut *work {
                Work::Static(work) => {
                    work();
                    Step::Done
                }
                Work::Condition(work) => Step::Branch(work()),
                Work::Subflow(work) => {
                    let mut subflow = Subflow::new(format!("{}::{}", graph.name(), view.name));
                    work(&mut subflow);
                    Step::Subflow(subflow)
                }
                Work::Module(inner) => Step::Module(inner.clone()),
            }));
            result.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(graph = graph.name(), task = view.name, %message, "task panicked");
                topology.fail(RunError::TaskPanicked {
                    task: view.name.to_owned(),
                    message,
                });
                Step::Done
            })
        };

        // The work lock is released before a nested graph runs.
        let step = match step {
            Step::Subflow(subflow) if !topology.should_skip() => {
                self.run_subflow(scope, subflow);
                Step::Done
            }
            Step::Module(inner) if !topology.should_skip() => {
                self.run_module(topology, &inner);
                Step::Done
            }
            Step::Subflow(_) | Step::Module(_) => Step::Done,
            step => step,
        };

        self.shared.observe(|observer| observer.on_exit(worker, &view));
        step
    }

    fn run_subflow(&mut self, parent: &Arc<Scope>, subflow: Subflow) {
        let (graph, detached) = subflow.into_parts();
        if graph.is_empty() {
            return;
        }
        let kind = if detached {
            ScopeKind::Detached(parent.clone())
        } else {
            ScopeKind::Joined
        };
        let Some(scope) = self.launch(Arc::new(graph), &parent.topology, kind) else {
            return;
        };
        if !detached {
            self.corun_until(|| scope.pending.is_zero());
        }
    }

    fn run_module(&mut self, topology: &Arc<Topology>, graph: &Arc<Graph>) {
        if !graph.try_enter() {
            warn!(graph = graph.name(), "module graph is already executing");
            topology.fail(RunError::GraphInUse {
                graph: graph.name().to_owned(),
            });
            return;
        }
        if let Some(scope) = self.launch(graph.clone(), topology, ScopeKind::Joined) {
            self.corun_until(|| scope.pending.is_zero());
        }
        graph.leave();
    }

    /// Schedule the sources of a nested graph on this worker.
    ///
    /// `None` if there is nothing to wait for: the graph is empty or invalid.
    fn launch(
        &self,
        graph: Arc<Graph>,
        topology: &Arc<Topology>,
        kind: ScopeKind,
    ) -> Option<Arc<Scope>> {
        let sources = match graph.plan() {
            Ok(plan) => plan.sources.clone(),
            Err(err) => {
                warn!(graph = graph.name(), %err, "nested graph rejected");
                topology.fail(err.into());
                return None;
            }
        };
        if sources.is_empty() {
            return None;
        }
        if let ScopeKind::Detached(parent) = &kind {
            parent.pending.add(1);
        }
        graph.arm();
        let scope = Scope::new(graph, topology.clone(), kind);
        scope.pending.add(sources.len());
        self.schedule(sources.into_iter().map(|node| Job {
            scope: scope.clone(),
            node,
        }));
        Some(scope)
    }

    /// Retire one job of `scope`; the last one completes the scope.
    fn finish(&self, scope: &Arc<Scope>) {
        if !scope.pending.release() {
            return;
        }
        match &scope.kind {
            ScopeKind::Root => self.shared.finish_pass(&scope.topology),
            ScopeKind::Joined => {}
            ScopeKind::Detached(parent) => self.finish(parent),
        }
    }
}

fn contains(semaphores: &[Semaphore], semaphore: &Semaphore) -> bool {
    semaphores.iter().any(|other| other.ptr_eq(semaphore))
}
