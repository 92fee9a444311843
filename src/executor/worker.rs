use super::{Job, Shared};
use crossbeam_deque::{Steal, Worker as Deque};
use rand::{Rng, rngs::SmallRng};
use std::{sync::Arc, thread};
use tracing::{debug, trace};

/// Execution context of one worker thread.
pub(super) struct Worker {
    pub(super) id: usize,
    pub(super) shared: Arc<Shared>,
    /// Local ready queues, one per priority level, highest first.
    queues: [Deque<Job>; 3],
    rng: SmallRng,
    /// Steal rounds (global queues, then one random peer) before sleeping.
    steal_bound: usize,
}

impl Worker {
    pub(super) fn new(
        id: usize,
        shared: Arc<Shared>,
        queues: [Deque<Job>; 3],
        rng: SmallRng,
        steal_bound: usize,
    ) -> Self {
        Self {
            id,
            shared,
            queues,
            rng,
            steal_bound,
        }
    }

    pub(super) fn run(mut self) {
        debug!(worker = self.id, "worker started");
        while let Some(job) = self.next_job() {
            self.invoke(job);
        }
        debug!(worker = self.id, "worker stopped");
    }

    /// Next job to run, sleeping while there is none. `None` on shutdown.
    fn next_job(&mut self) -> Option<Job> {
        loop {
            if let Some(job) = self.find_job() {
                return Some(job);
            }
            if !self.sleep() {
                return None;
            }
        }
    }

    fn find_job(&mut self) -> Option<Job> {
        self.pop_local().or_else(|| self.steal())
    }

    /// Highest-priority local job.
    fn pop_local(&self) -> Option<Job> {
        self.queues.iter().find_map(Deque::pop)
    }

    fn steal(&mut self) -> Option<Job> {
        let num_workers = self.shared.stealers.len();
        for _ in 0..self.steal_bound {
            for (injector, queue) in self.shared.injectors.iter().zip(&self.queues) {
                if let Some(job) = retry(|| injector.steal_batch_and_pop(queue)) {
                    return Some(job);
                }
            }
            if num_workers < 2 {
                continue;
            }
            // Any peer but ourselves.
            let victim = (self.id + 1 + self.rng.random_range(0..num_workers - 1)) % num_workers;
            for stealer in &self.shared.stealers[victim] {
                if let Some(job) = retry(|| stealer.steal()) {
                    trace!(worker = self.id, victim, "stole job");
                    return Some(job);
                }
            }
        }
        None
    }

    /// Block until woken. Returns `false` once the executor shuts down.
    ///
    /// The queues are re-checked under the idle lock: a producer pushes before
    /// it takes that lock to notify, so either the check sees its job or the
    /// producer sees this worker in `sleeping`.
    fn sleep(&self) -> bool {
        let mut idle = self.shared.idle.lock();
        if idle.shutdown {
            return false;
        }
        if self.shared.has_visible_work() {
            return true;
        }
        idle.sleeping += 1;
        self.shared.wake.wait(&mut idle);
        idle.sleeping -= 1;
        !idle.shutdown
    }

    /// Push ready jobs onto the local queues and wake peers to steal them.
    pub(super) fn schedule(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut pushed = 0;
        for job in jobs {
            self.queues[job.priority().index()].push(job);
            pushed += 1;
        }
        if pushed != 0 {
            self.shared.notify(pushed);
        }
    }

    /// Run other jobs on this thread until `done` holds.
    pub(super) fn corun_until(&mut self, done: impl Fn() -> bool) {
        while !done() {
            match self.find_job() {
                Some(job) => self.invoke(job),
                None => thread::yield_now(),
            }
        }
    }
}

fn retry<T>(mut attempt: impl FnMut() -> Steal<T>) -> Option<T> {
    loop {
        match attempt() {
            Steal::Success(job) => return Some(job),
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}
