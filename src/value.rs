//! The promise handle returned by `fire`.
//!
//! A [`Value`] is installed on an event when it is fired and collects the
//! results of its handlers: the last non-nil return, an error flag, and a
//! promise flag set when at least one handler suspended. Consumers keep the
//! handle and inspect it after the event (and its tasks) have settled.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::event::{Event, EventInner};
use crate::manager::{Manager, ManagerInner};

/// Cheaply cloneable promise handle.
#[derive(Clone)]
pub struct Value {
    inner: Arc<ValueInner>,
}

struct ValueInner {
    value: Mutex<Option<serde_json::Value>>,
    errors: AtomicBool,
    promise: AtomicBool,
    informed: AtomicBool,
    notify: bool,
    event: Weak<EventInner>,
    manager: Weak<ManagerInner>,
}

impl Value {
    /// Create a value bound to a fired event and the root manager that will
    /// dispatch it.
    pub(crate) fn new(event: &Event, manager: &Manager, notify: bool) -> Self {
        Self {
            inner: Arc::new(ValueInner {
                value: Mutex::new(None),
                errors: AtomicBool::new(false),
                promise: AtomicBool::new(false),
                informed: AtomicBool::new(false),
                notify,
                event: event.downgrade(),
                manager: manager.downgrade(),
            }),
        }
    }

    /// A value with no owning event, installed on freshly built events
    /// until they are fired.
    pub(crate) fn detached() -> Self {
        Self {
            inner: Arc::new(ValueInner {
                value: Mutex::new(None),
                errors: AtomicBool::new(false),
                promise: AtomicBool::new(false),
                informed: AtomicBool::new(false),
                notify: false,
                event: Weak::new(),
                manager: Weak::new(),
            }),
        }
    }

    /// The last result assigned by a handler or task, if any.
    pub fn get(&self) -> Option<serde_json::Value> {
        self.inner.value.lock().clone()
    }

    /// Assign a result.
    pub fn set(&self, value: serde_json::Value) {
        *self.inner.value.lock() = Some(value);
    }

    /// True once any handler or task for the event has failed.
    pub fn has_errors(&self) -> bool {
        self.inner.errors.load(Ordering::Acquire)
    }

    pub(crate) fn set_errors(&self) {
        self.inner.errors.store(true, Ordering::Release);
    }

    /// True when at least one handler suspended; the final result arrives
    /// only after the suspended tasks run to completion.
    pub fn is_promise(&self) -> bool {
        self.inner.promise.load(Ordering::Acquire)
    }

    pub(crate) fn set_promise(&self) {
        self.inner.promise.store(true, Ordering::Release);
    }

    /// True once `inform(true)` ran, i.e. every suspended task settled.
    pub fn is_informed(&self) -> bool {
        self.inner.informed.load(Ordering::Acquire)
    }

    /// Completion notification hook.
    ///
    /// Records the done flag and, when the owning event opted in with
    /// `notify`, fires a `value_changed` event on the event's channels.
    pub fn inform(&self, done: bool) {
        self.inner.informed.store(done, Ordering::Release);
        if !self.inner.notify {
            return;
        }
        let event = self.inner.event.upgrade().map(Event::from_arc);
        let manager = self.inner.manager.upgrade().map(Manager::from_arc);
        if let (Some(event), Some(manager)) = (event, manager) {
            manager.fire_to(Event::value_changed(self.clone()), &event.channels());
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("value", &self.get())
            .field("errors", &self.has_errors())
            .field("promise", &self.is_promise())
            .finish()
    }
}
