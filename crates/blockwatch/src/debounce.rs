//! Trailing-edge debounce as a plain state machine.
//!
//! `Idle --trigger--> Pending{deadline}`; every further trigger moves the deadline to
//! `now + interval`. `fire_if_due` at or past the deadline returns true once and goes back
//! to `Idle`. Time is passed in, so the caller decides which clock drives it.

use tokio::time::{Duration, Instant};

/// Default quiescence interval before a burst is flushed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Pending { deadline: Instant },
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    interval: Duration,
    state: State,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: State::Idle,
        }
    }

    /// Record a trigger at `now`. Returns the (new) deadline.
    pub fn trigger(&mut self, now: Instant) -> Instant {
        let deadline = now + self.interval;
        self.state = State::Pending { deadline };
        deadline
    }

    /// Deadline of the pending flush, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Idle => None,
            State::Pending { deadline } => Some(deadline),
        }
    }

    /// True exactly once per burst, when `now` has reached the deadline.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.state {
            State::Pending { deadline } if now >= deadline => {
                self.state = State::Idle;
                true
            }
            _ => false,
        }
    }

    /// Drop a pending flush and report whether there was one (used for the final flush on
    /// shutdown).
    pub fn take_pending(&mut self) -> bool {
        std::mem::replace(&mut self.state, State::Idle) != State::Idle
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}
