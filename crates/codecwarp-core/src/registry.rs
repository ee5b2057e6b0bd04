//! Process-wide live-object counters used to assert zero-leak invariants.
//!
//! Counters are only ever changed through [`Tracked`], a guard embedded in
//! every tracked type: constructing the guard increments the counter for its
//! kind and dropping it decrements. Everything else reads [`snapshot`].

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kinds of resources with a live-object counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Session,
    Worker,
    CodecHandle,
    QueuedItem,
    Delivery,
    Dispatcher,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Session,
        ResourceKind::Worker,
        ResourceKind::CodecHandle,
        ResourceKind::QueuedItem,
        ResourceKind::Delivery,
        ResourceKind::Dispatcher,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

static COUNTERS: [AtomicUsize; 6] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

/// Live-object guard. Hold one as a field of the tracked type.
#[derive(Debug)]
pub struct Tracked {
    kind: ResourceKind,
}

impl Tracked {
    pub fn new(kind: ResourceKind) -> Self {
        COUNTERS[kind.index()].fetch_add(1, Ordering::AcqRel);
        Self { kind }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        COUNTERS[self.kind.index()].fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySnapshot {
    counts: [usize; 6],
}

impl RegistrySnapshot {
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.counts[kind.index()]
    }

    /// Iterate over `(kind, live count)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, usize)> + '_ {
        ResourceKind::ALL.iter().map(move |&k| (k, self.count(k)))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }
}

/// Read every counter
pub fn snapshot() -> RegistrySnapshot {
    let mut counts = [0usize; 6];
    for kind in ResourceKind::ALL {
        counts[kind.index()] = COUNTERS[kind.index()].load(Ordering::Acquire);
    }
    RegistrySnapshot { counts }
}
