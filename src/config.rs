use crate::error::BuildError;
use std::{env, num::NonZeroUsize, thread};

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads. Must be positive.
    pub num_workers: usize,
    /// Stop dispatching the remaining nodes of a run once one of its tasks
    /// panicked. The bookkeeping of skipped nodes still runs so the run drains.
    pub halt_on_panic: bool,
    /// Steal rounds a worker attempts before it goes to sleep.
    /// `None` picks `2 * (num_workers + 1)`.
    pub steal_bound: Option<usize>,
    /// Seed of the per-worker victim-selection generators.
    pub seed: u64,
    /// Prefix of worker thread names; the worker index is appended.
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            halt_on_panic: true,
            steal_bound: None,
            seed: 0x9E37_79B9_7F4A_7C15,
            thread_name: "taskweave-worker".to_owned(),
        }
    }
}

impl ExecutorConfig {
    /// Default configuration with an explicit worker count.
    #[must_use]
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    /// Defaults overridden by environment variables.
    ///
    /// - `TASKWEAVE_NUM_WORKERS`: worker thread count
    /// - `TASKWEAVE_HALT_ON_PANIC`: `true`/`false`
    /// - `TASKWEAVE_STEAL_BOUND`: steal rounds before sleeping
    /// - `TASKWEAVE_SEED`: victim-selection seed
    ///
    /// Unparsable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|value| value.trim().parse().ok());
        Self {
            num_workers: parse("TASKWEAVE_NUM_WORKERS").unwrap_or(defaults.num_workers),
            halt_on_panic: lookup("TASKWEAVE_HALT_ON_PANIC")
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.halt_on_panic),
            steal_bound: parse("TASKWEAVE_STEAL_BOUND").or(defaults.steal_bound),
            seed: lookup("TASKWEAVE_SEED")
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.seed),
            thread_name: defaults.thread_name,
        }
    }

    /// # Errors
    /// [`BuildError::NoWorkers`] if `num_workers` is zero.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.num_workers == 0 {
            return Err(BuildError::NoWorkers);
        }
        Ok(())
    }

    pub(crate) fn effective_steal_bound(&self) -> usize {
        self.steal_bound
            .unwrap_or_else(|| 2 * (self.num_workers + 1))
            .max(1)
    }
}
