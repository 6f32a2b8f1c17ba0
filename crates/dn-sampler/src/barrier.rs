//! Reusable N-party barrier.
//!
//! The worker phases of one sampler iteration are bounded by barrier
//! waits, so the barrier must be reusable for an unbounded number of
//! rendezvous. Implemented as a generation-counted mutex/condvar pair: a
//! waiter parked on generation `g` wakes only once the generation
//! advances, which makes back-to-back waits safe.

use std::sync::{Condvar, Mutex};

/// A reusable rendezvous for a fixed number of parties.
pub struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

struct BarrierState {
    waiting: usize,
    generation: u64,
}

impl Barrier {
    /// Create a barrier for `parties` threads.
    pub fn new(parties: usize) -> Self {
        assert!(parties >= 1, "a barrier needs at least one party");
        Self {
            parties,
            state: Mutex::new(BarrierState { waiting: 0, generation: 0 }),
            cvar: Condvar::new(),
        }
    }

    /// Block until all parties have arrived. Returns `true` on exactly
    /// one of the released threads per rendezvous.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("barrier mutex poisoned");
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return true;
        }
        while state.generation == generation {
            state = self.cvar.wait(state).expect("barrier mutex poisoned");
        }
        false
    }
}
