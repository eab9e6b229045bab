//! One-shot start gate shared by the coordinator and every device worker.
//!
//! A worker takes a [`Ticket`] while arming, acknowledges `START`, then blocks
//! in [`StartBarrier::wait`]. The coordinator calls [`StartBarrier::release`]
//! exactly once per run after every device has acknowledged. Clearing the
//! barrier ends the current generation: tickets taken before the clear resolve
//! as [`Gate::Aborted`] and later tickets block until the next release.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    generation: u64,
    released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Released,
    Aborted,
}

/// Generation token handed out while a worker arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone, Default)]
pub struct StartBarrier {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl StartBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> Ticket {
        Ticket(self.inner.0.lock().generation)
    }

    /// Block until the generation of `ticket` is released or cleared.
    pub fn wait(&self, ticket: Ticket) -> Gate {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        loop {
            if state.generation != ticket.0 {
                return Gate::Aborted;
            }
            if state.released {
                return Gate::Released;
            }
            cvar.wait(&mut state);
        }
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.released = true;
        cvar.notify_all();
    }

    pub fn clear(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.generation += 1;
        state.released = false;
        cvar.notify_all();
    }

    /// `false` once the generation of `ticket` has been cleared.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.inner.0.lock().generation == ticket.0
    }

    pub fn is_released(&self) -> bool {
        self.inner.0.lock().released
    }
}
