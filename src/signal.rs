//! Process signal wiring for `run()`.
//!
//! The hook fires a `signal` event into the manager from the signal
//! delivery thread; the cross-thread enqueue path wakes a blocked tick, and
//! an internal handler on `signal` then performs the actual `stop()` on the
//! executing thread.

use std::sync::Once;

use crate::event::Event;
use crate::manager::Manager;

static HOOK: Once = Once::new();

/// Install the process-wide interrupt/termination hook, once.
pub(crate) fn install(manager: &Manager) {
    let manager = manager.clone();
    HOOK.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            manager.fire(Event::signal());
        }) {
            log::warn!("[Manager] could not install signal hook: {err}");
        }
    });
}
