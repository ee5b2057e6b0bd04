//! Caller-visible queue depth and saturation.
//!
//! Depth counts admitted items that are not yet resolved. An item resolves
//! when its first output or its error reaches the owner, when the worker
//! discards it, when a flush covering it completes, or on reset. Sequence
//! ids are never reused, so resolving an id that is no longer outstanding
//! is a no-op.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use codecwarp_core::{QueueLimits, SessionError};

struct Outstanding {
    ids: BTreeSet<u64>,
    limits: QueueLimits,
    saturated: bool,
}

impl Outstanding {
    fn recompute(&mut self) {
        self.saturated = self.ids.len() >= self.limits.soft;
    }
}

pub(crate) struct QueueAccounting {
    state: Mutex<Outstanding>,
}

impl QueueAccounting {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            state: Mutex::new(Outstanding {
                ids: BTreeSet::new(),
                limits,
                saturated: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Outstanding> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_limits(&self, limits: QueueLimits) {
        let mut state = self.lock();
        state.limits = limits;
        state.recompute();
    }

    /// Admit `sequence_id`, or reject it when the hard limit is reached
    pub fn admit(&self, sequence_id: u64) -> Result<(), SessionError> {
        let mut state = self.lock();
        let depth = state.ids.len();
        if depth >= state.limits.hard {
            return Err(SessionError::ResourceExhausted {
                depth,
                limit: state.limits.hard,
            });
        }
        state.ids.insert(sequence_id);
        state.recompute();
        Ok(())
    }

    pub fn resolve(&self, sequence_id: u64) {
        let mut state = self.lock();
        if state.ids.remove(&sequence_id) {
            state.recompute();
        }
    }

    /// Resolve every id up to and including `barrier`
    pub fn resolve_through(&self, barrier: u64) {
        let mut state = self.lock();
        match barrier.checked_add(1) {
            Some(next) => {
                let newer = state.ids.split_off(&next);
                state.ids = newer;
            }
            None => state.ids.clear(),
        }
        state.recompute();
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.ids.clear();
        state.recompute();
    }

    pub fn depth(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_saturated(&self) -> bool {
        self.lock().saturated
    }
}
