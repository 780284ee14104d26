use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a waiter stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The condition being waited on was released.
    Released,
    /// The object being waited on was destroyed.
    Destroyed,
    /// The waiter gave up.
    Timeout,
    /// An asynchronous event was delivered.
    Event,
}

#[derive(Debug)]
struct QueueState {
    generation: u64,
    reason: WaitReason,
}

/// Blocks threads until a condition clears or the queue is woken with a reason.
#[derive(Debug)]
pub struct WaitQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                generation: 0,
                reason: WaitReason::Released,
            }),
            cond: Condvar::new(),
        }
    }

    /// Waits while `blocked` returns `true`.
    ///
    /// `blocked` is evaluated under the queue lock, so a waker that changes the condition before
    /// calling [`WaitQueue::wake`] is never missed. Returns [`WaitReason::Released`] once `blocked`
    /// is false, or the reason of a `Destroyed`/`Event` wake that arrived while waiting.
    pub fn wait_while<F>(&self, mut blocked: F, timeout: Option<Duration>) -> WaitReason
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let start = state.generation;
        loop {
            if !blocked() {
                return WaitReason::Released;
            }
            if state.generation != start && state.reason != WaitReason::Released {
                return state.reason;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() && blocked() {
                        return WaitReason::Timeout;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Wakes every waiter with `reason`.
    pub fn wake(&self, reason: WaitReason) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.reason = reason;
        self.cond.notify_all();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
