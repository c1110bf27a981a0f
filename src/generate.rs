//! Tick-loop pacing: the `generate_events` token and its fallback waiter.
//!
//! Each scheduling pass of a running manager fires a `generate_events`
//! event carrying a [`GenerateToken`]. Event-source handlers consume it to
//! poll for outside work; the lazily registered fallback component simply
//! blocks on the token until its (mutable) time budget elapses. Producers
//! on other threads shorten the budget to zero when they enqueue, which is
//! the sole mechanism waking an idle tick loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::event::GENERATE_EVENTS;
use crate::handler::{Handler, HandlerReturn};
use crate::manager::Manager;

/// A wait budget with a mutable deadline.
///
/// `None` means "may block indefinitely"; reducing the budget wakes any
/// waiter so it can re-evaluate. Reductions are advisory: shortening a
/// token the tick loop has already moved past has no effect.
pub struct GenerateToken {
    remaining: Mutex<Option<Duration>>,
    cond: Condvar,
}

impl GenerateToken {
    /// Create a token with the given initial budget.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            remaining: Mutex::new(timeout),
            cond: Condvar::new(),
        }
    }

    /// Lower the remaining budget to at most `limit` and wake any waiter.
    pub fn reduce_time_left(&self, limit: Duration) {
        let mut remaining = self.remaining.lock();
        match *remaining {
            Some(current) if current <= limit => {}
            _ => *remaining = Some(limit),
        }
        self.cond.notify_all();
    }

    /// The remaining budget, `None` when unbounded.
    pub fn time_left(&self) -> Option<Duration> {
        *self.remaining.lock()
    }

    /// Block until the budget elapses, re-evaluating on every reduction.
    pub fn wait(&self) {
        let started = Instant::now();
        let mut remaining = self.remaining.lock();
        loop {
            match *remaining {
                Some(budget) => {
                    let elapsed = started.elapsed();
                    if elapsed >= budget {
                        return;
                    }
                    if self.cond.wait_for(&mut remaining, budget - elapsed).timed_out() {
                        return;
                    }
                }
                None => {
                    self.cond.wait(&mut remaining);
                }
            }
        }
    }
}

/// Build the fallback generator component: a child manager whose only
/// handler blocks on the token at priority −100, after every real event
/// source had its chance to consume it.
pub(crate) fn fallback_generator() -> Manager {
    let component = Manager::new();
    component.add_handler(
        Handler::new("fallback_generate", |call| {
            if let Some(token) = call.args.first().and_then(|arg| arg.as_token()) {
                token.wait();
            }
            Ok(HandlerReturn::None)
        })
        .on(GENERATE_EVENTS)
        .channel("*")
        .priority(-100.0),
    );
    component
}

/// Shorthand used by the tick loop.
pub(crate) fn token(timeout: Option<Duration>) -> Arc<GenerateToken> {
    Arc::new(GenerateToken::new(timeout))
}
