//! Event records and the lifecycle events fired by the dispatch core.
//!
//! An [`Event`] is a named record with an ordered payload, routing
//! channels, opt-in flags (`success`, `failure`, `complete`, `notify`,
//! `alert_done`) and the bookkeeping the dispatcher maintains while the
//! event and its suspended handlers are in flight (`waiting_handlers`,
//! `cause`/`effects`, the installed [`Value`]).
//!
//! Lifecycle events derived from another event take its name as a prefix:
//! `hello` with `success` set produces a `hello_success` event once every
//! handler ran cleanly.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::DispatchError;
use crate::generate::GenerateToken;
use crate::handler::Handler;
use crate::manager::Manager;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Event names fired by the core
// ---------------------------------------------------------------------------

/// Fired by `run()` once the manager starts ticking.
pub const STARTED: &str = "started";
/// Fired by `stop()` before the final drain ticks.
pub const STOPPED: &str = "stopped";
/// Fired from the process signal hook.
pub const SIGNAL: &str = "signal";
/// Fired for every captured handler or task failure.
pub const ERROR: &str = "error";
/// The tick-loop pacing token event.
pub const GENERATE_EVENTS: &str = "generate_events";
/// Fired by `Value::inform` for events that opted in with `notify`.
pub const VALUE_CHANGED: &str = "value_changed";

// ---------------------------------------------------------------------------
// Payload arguments
// ---------------------------------------------------------------------------

/// A single payload argument.
///
/// Ordinary data travels as JSON; the handle variants exist for the
/// lifecycle events the core fires about its own objects.
#[derive(Clone)]
pub enum Arg {
    /// Plain data.
    Json(serde_json::Value),
    /// An event handle (e.g. the original event on a `{name}_success`).
    Event(Event),
    /// A promise handle (e.g. on `value_changed`).
    Value(Value),
    /// A manager handle (e.g. on `started` / `stopped`).
    Manager(Manager),
    /// A captured failure (on `error` / `{name}_failure`).
    Error(DispatchError),
    /// The pacing token (on `generate_events`).
    Token(Arc<GenerateToken>),
}

impl Arg {
    /// The JSON payload, if this argument is plain data.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Arg::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The event handle, if any.
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Arg::Event(event) => Some(event),
            _ => None,
        }
    }

    /// The captured failure, if any.
    pub fn as_error(&self) -> Option<&DispatchError> {
        match self {
            Arg::Error(error) => Some(error),
            _ => None,
        }
    }

    /// The pacing token, if any.
    pub fn as_token(&self) -> Option<&Arc<GenerateToken>> {
        match self {
            Arg::Token(token) => Some(token),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Arg::Json(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<Event> for Arg {
    fn from(event: Event) -> Self {
        Arg::Event(event)
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Json(value) => write!(f, "{value}"),
            Arg::Event(event) => write!(f, "{event:?}"),
            Arg::Value(value) => write!(f, "{value:?}"),
            Arg::Manager(manager) => write!(f, "{manager:?}"),
            Arg::Error(error) => write!(f, "error({error})"),
            Arg::Token(_) => write!(f, "<generate token>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Cheaply cloneable event handle.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

pub(crate) struct EventInner {
    id: Uuid,
    created_at: DateTime<Utc>,
    name: String,
    args: Mutex<Vec<Arg>>,
    kwargs: Mutex<HashMap<String, Arg>>,
    channels: Mutex<Vec<Channel>>,
    success: AtomicBool,
    failure: AtomicBool,
    complete: AtomicBool,
    notify: AtomicBool,
    alert_done: AtomicBool,
    success_channels: Mutex<Option<Vec<Channel>>>,
    complete_channels: Mutex<Option<Vec<Channel>>>,
    waiting_handlers: AtomicUsize,
    effects: AtomicUsize,
    cause: Mutex<Option<Event>>,
    handler: Mutex<Option<Arc<Handler>>>,
    value: RwLock<Value>,
}

impl Event {
    /// Create a named event with an empty payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                name: name.into(),
                args: Mutex::new(Vec::new()),
                kwargs: Mutex::new(HashMap::new()),
                channels: Mutex::new(Vec::new()),
                success: AtomicBool::new(false),
                failure: AtomicBool::new(false),
                complete: AtomicBool::new(false),
                notify: AtomicBool::new(false),
                alert_done: AtomicBool::new(false),
                success_channels: Mutex::new(None),
                complete_channels: Mutex::new(None),
                waiting_handlers: AtomicUsize::new(0),
                effects: AtomicUsize::new(0),
                cause: Mutex::new(None),
                handler: Mutex::new(None),
                value: RwLock::new(Value::detached()),
            }),
        }
    }

    // -- builder ------------------------------------------------------------

    /// Append a payload argument.
    pub fn with_arg(self, arg: impl Into<Arg>) -> Self {
        self.inner.args.lock().push(arg.into());
        self
    }

    /// Insert a keyword payload argument.
    pub fn with_kwarg(self, key: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.inner.kwargs.lock().insert(key.into(), arg.into());
        self
    }

    /// Opt in to a `{name}_success` event after a clean dispatch.
    pub fn with_success(self, yes: bool) -> Self {
        self.inner.success.store(yes, Ordering::Release);
        self
    }

    /// Opt in to a `{name}_failure` event when a handler fails.
    pub fn with_failure(self, yes: bool) -> Self {
        self.inner.failure.store(yes, Ordering::Release);
        self
    }

    /// Opt in to a `{name}_complete` event once this event and every event
    /// it transitively triggered have settled.
    pub fn with_complete(self, yes: bool) -> Self {
        self.inner.complete.store(yes, Ordering::Release);
        self
    }

    /// Opt in to `value_changed` notifications from the installed value.
    pub fn with_notify(self, yes: bool) -> Self {
        self.inner.notify.store(yes, Ordering::Release);
        self
    }

    /// Override the channels `{name}_success` is fired on.
    pub fn with_success_channels(self, channels: Vec<Channel>) -> Self {
        *self.inner.success_channels.lock() = Some(channels);
        self
    }

    /// Override the channels `{name}_complete` is fired on.
    pub fn with_complete_channels(self, channels: Vec<Channel>) -> Self {
        *self.inner.complete_channels.lock() = Some(channels);
        self
    }

    // -- accessors ----------------------------------------------------------

    /// Unique id of this event instance.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Creation timestamp (UTC).
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Case-sensitive event name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the positional payload.
    pub fn args(&self) -> Vec<Arg> {
        self.inner.args.lock().clone()
    }

    /// Snapshot of the keyword payload.
    pub fn kwargs(&self) -> HashMap<String, Arg> {
        self.inner.kwargs.lock().clone()
    }

    /// The channels this event was fired on.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.lock().clone()
    }

    pub(crate) fn set_channels(&self, channels: Vec<Channel>) {
        *self.inner.channels.lock() = channels;
    }

    pub fn success(&self) -> bool {
        self.inner.success.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> bool {
        self.inner.failure.load(Ordering::Acquire)
    }

    pub fn complete(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    pub fn notify(&self) -> bool {
        self.inner.notify.load(Ordering::Acquire)
    }

    /// Whether a `{name}_done` event is fired when this event settles.
    pub fn alert_done(&self) -> bool {
        self.inner.alert_done.load(Ordering::Acquire)
    }

    /// Request a `{name}_done` event when this event settles.
    pub fn set_alert_done(&self, yes: bool) {
        self.inner.alert_done.store(yes, Ordering::Release);
    }

    pub(crate) fn success_channels(&self) -> Option<Vec<Channel>> {
        self.inner.success_channels.lock().clone()
    }

    pub(crate) fn complete_channels(&self) -> Option<Vec<Channel>> {
        self.inner.complete_channels.lock().clone()
    }

    /// The promise installed by the most recent `fire`.
    pub fn value(&self) -> Value {
        self.inner.value.read().clone()
    }

    pub(crate) fn install_value(&self, value: Value) {
        *self.inner.value.write() = value;
    }

    // -- dispatcher bookkeeping --------------------------------------------

    /// Number of live suspended tasks derived from this event.
    pub fn waiting_handlers(&self) -> usize {
        self.inner.waiting_handlers.load(Ordering::Acquire)
    }

    pub(crate) fn inc_waiting(&self) {
        self.inner.waiting_handlers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_waiting(&self) -> usize {
        let before = self.inner.waiting_handlers.load(Ordering::Acquire);
        let after = before.saturating_sub(1);
        self.inner.waiting_handlers.store(after, Ordering::Release);
        after
    }

    /// Count of unfinished events in this completion subtree, including
    /// the event itself.
    pub fn effects(&self) -> usize {
        self.inner.effects.load(Ordering::Acquire)
    }

    pub(crate) fn set_effects(&self, count: usize) {
        self.inner.effects.store(count, Ordering::Release);
    }

    pub(crate) fn inc_effects(&self) {
        self.inner.effects.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_effects(&self) -> usize {
        let before = self.inner.effects.load(Ordering::Acquire);
        let after = before.saturating_sub(1);
        self.inner.effects.store(after, Ordering::Release);
        after
    }

    /// Back-pointer to the event that triggered this one (or the event
    /// itself at the root of a completion tree).
    pub fn cause(&self) -> Option<Event> {
        self.inner.cause.lock().clone()
    }

    pub(crate) fn set_cause(&self, cause: Option<Event>) {
        *self.inner.cause.lock() = cause;
    }

    /// Drop completion-tracking state once the subtree has settled. This
    /// also breaks the self-referential cause cycle of tree roots.
    pub(crate) fn clear_completion(&self) {
        *self.inner.cause.lock() = None;
        self.inner.effects.store(0, Ordering::Release);
    }

    /// The handler currently (or most recently) invoked for this event.
    pub fn handler(&self) -> Option<Arc<Handler>> {
        self.inner.handler.lock().clone()
    }

    pub(crate) fn set_handler(&self, handler: Option<Arc<Handler>>) {
        *self.inner.handler.lock() = handler;
    }

    // -- weak handles -------------------------------------------------------

    pub(crate) fn downgrade(&self) -> Weak<EventInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_arc(inner: Arc<EventInner>) -> Self {
        Self { inner }
    }

    // -- lifecycle constructors --------------------------------------------

    /// `started` event carrying the manager that began running.
    pub fn started(manager: &Manager) -> Self {
        Event::new(STARTED).with_arg(Arg::Manager(manager.clone()))
    }

    /// `stopped` event carrying the manager being shut down.
    pub fn stopped(manager: &Manager) -> Self {
        Event::new(STOPPED).with_arg(Arg::Manager(manager.clone()))
    }

    /// `signal` event fired from the process signal hook.
    pub fn signal() -> Self {
        Event::new(SIGNAL)
    }

    /// `error` event carrying a captured failure and, when known, the name
    /// of the handler that raised it.
    pub fn error(error: DispatchError, handler: Option<String>) -> Self {
        let event = Event::new(ERROR).with_arg(Arg::Error(error));
        match handler {
            Some(name) => event.with_kwarg("handler", name.as_str()),
            None => event,
        }
    }

    /// `generate_events` pacing event carrying its wait token.
    pub fn generate(token: Arc<GenerateToken>) -> Self {
        Event::new(GENERATE_EVENTS).with_arg(Arg::Token(token))
    }

    /// `value_changed` notification carrying the promise handle.
    pub fn value_changed(value: Value) -> Self {
        Event::new(VALUE_CHANGED).with_arg(Arg::Value(value))
    }

    /// `{name}_success` derived from a cleanly dispatched event.
    pub(crate) fn success_of(event: &Event) -> Self {
        Event::new(format!("{}_success", event.name()))
            .with_arg(Arg::Event(event.clone()))
            .with_arg(Arg::Json(event.value().get().unwrap_or(serde_json::Value::Null)))
    }

    /// `{name}_failure` derived from a failed event.
    pub(crate) fn failure_of(event: &Event, error: DispatchError) -> Self {
        Event::new(format!("{}_failure", event.name()))
            .with_arg(Arg::Event(event.clone()))
            .with_arg(Arg::Error(error))
    }

    /// `{name}_done` derived from a settled event that asked for it.
    pub(crate) fn done_of(event: &Event) -> Self {
        Event::new(format!("{}_done", event.name()))
            .with_arg(Arg::Event(event.clone()))
            .with_arg(Arg::Json(event.value().get().unwrap_or(serde_json::Value::Null)))
    }

    /// `{name}_complete` derived from a settled completion tree root.
    pub(crate) fn complete_of(event: &Event) -> Self {
        Event::new(format!("{}_complete", event.name()))
            .with_arg(Arg::Event(event.clone()))
            .with_arg(Arg::Json(event.value().get().unwrap_or(serde_json::Value::Null)))
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} {} channels={:?} waiting={}>",
            self.inner.name,
            self.inner.id,
            self.channels(),
            self.waiting_handlers()
        )
    }
}
