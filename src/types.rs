use crate::sync::{AtomicUsize, Ordering};
use derive_more::Display;
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;

/// Stable handle of a node inside the [`Graph`](crate::graph::Graph) that
/// created it.
///
/// Handles are plain indices into the graph's node arena, so edges between
/// nodes (including the back edges of conditional loops) never form ownership
/// cycles.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in its graph, in insertion order.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Scheduling hint applied among nodes that are ready on the same worker.
#[derive(Debug, Display, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Dispatched before any other ready node of the worker.
    #[display("high")]
    High,
    /// The default level.
    #[default]
    #[display("normal")]
    Normal,
    /// Dispatched only when no higher-priority node is ready locally.
    #[display("low")]
    Low,
}

impl Priority {
    /// All levels, in dispatch order.
    pub const ALL: [Self; 3] = [Self::High, Self::Normal, Self::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Counter of outstanding dependencies or in-flight jobs.
///
/// The decrement that observes the transition to zero is the only one that
/// returns `true`, which makes it the unique trigger for whatever follows
/// (enqueueing a node, completing a scope). `AcqRel` on every decrement chains
/// the writes of all previous decrementers into the winner.
#[derive(Debug)]
pub(crate) struct JoinCounter(AtomicUsize);

impl JoinCounter {
    pub(crate) fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }

    /// Re-arm the counter. Only valid while nobody else decrements it.
    pub(crate) fn arm(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Returns `true` iff this call brought the counter to zero. A counter
    /// already at zero stays there.
    pub(crate) fn release(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            == Ok(1)
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }
}

/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
