use std::sync::{Condvar, Mutex};

/// A reusable thread barrier that can be torn down.
///
/// `destroy` wakes every waiter and makes all subsequent waits return
/// immediately; waiters learn from the return value whether the barrier
/// tripped normally or was destroyed. Needed at shutdown, where worker
/// threads may be parked waiting for peers that will never arrive.
pub struct Barrier {
    participants: usize,
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    waiting: usize,
    generation: u64,
    destroyed: bool,
}

impl Barrier {
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "barrier needs at least one participant");
        Self {
            participants,
            state: Mutex::new(State {
                waiting: 0,
                generation: 0,
                destroyed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Block until all participants arrive. Returns false if the barrier
    /// was destroyed before (or while) waiting.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("barrier mutex poisoned");
        if state.destroyed {
            return false;
        }
        state.waiting += 1;
        if state.waiting == self.participants {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation && !state.destroyed {
            state = self.condvar.wait(state).expect("barrier mutex poisoned");
        }
        !state.destroyed
    }

    /// Wake all waiters and disable the barrier permanently.
    pub fn destroy(&self) {
        let mut state = self.state.lock().expect("barrier mutex poisoned");
        state.destroyed = true;
        self.condvar.notify_all();
    }
}
