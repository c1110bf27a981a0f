//! Handler records: the callable plus its routing metadata.
//!
//! Handlers are first-class records holding the raw callable together with
//! the manager that owns them, bound at registration time. Metadata mirrors
//! the decorator contract: `names` (event names; empty means any),
//! `channel` (inherited from the owning manager when unset), `priority`
//! (higher runs first), `filter` (a truthy return suppresses the remaining
//! handlers), `event` (whether the callable receives the event handle) and
//! `tick` (also registered as a periodic tick source).

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::panic_message;
use crate::event::{Arg, Event};
use crate::manager::{Manager, ManagerInner};
use crate::task::Coroutine;

static HANDLER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

static EMPTY_KWARGS: Lazy<HashMap<String, Arg>> = Lazy::new(HashMap::new);

// ---------------------------------------------------------------------------
// Invocation types
// ---------------------------------------------------------------------------

/// Borrowed view passed to a handler on invocation.
pub struct HandlerCall<'a> {
    /// The manager the handler is bound to.
    pub manager: Manager,
    /// The event being dispatched; `None` for handlers that did not opt in
    /// with `event`, and for tick invocations.
    pub event: Option<&'a Event>,
    /// Positional payload of the event.
    pub args: &'a [Arg],
    /// Keyword payload of the event.
    pub kwargs: &'a HashMap<String, Arg>,
}

/// What a handler produced.
pub enum HandlerReturn {
    /// Nothing; the event's value is left untouched.
    None,
    /// A plain result, assigned to the event's value.
    Value(serde_json::Value),
    /// The handler suspended; the coroutine is registered as a task and
    /// resumed on subsequent ticks.
    Suspend(Box<dyn Coroutine>),
}

impl HandlerReturn {
    /// Convenience constructor for a plain result.
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        HandlerReturn::Value(value.into())
    }

    /// Convenience constructor for a suspension.
    pub fn suspend(coroutine: Box<dyn Coroutine>) -> Self {
        HandlerReturn::Suspend(coroutine)
    }
}

impl fmt::Debug for HandlerReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerReturn::None => write!(f, "None"),
            HandlerReturn::Value(value) => write!(f, "Value({value})"),
            HandlerReturn::Suspend(_) => write!(f, "Suspend(..)"),
        }
    }
}

/// The handler callable type.
pub type HandlerFn =
    Arc<dyn Fn(HandlerCall<'_>) -> anyhow::Result<HandlerReturn> + Send + Sync>;

/// JSON truthiness, used for the filter short-circuit: `null`, `false`,
/// `0`, `""`, `[]` and `{}` are falsy.
pub(crate) fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A callable bound to a manager, with routing metadata.
pub struct Handler {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) names: Vec<String>,
    pub(crate) channel: Option<String>,
    pub(crate) priority: f64,
    pub(crate) filter: bool,
    pub(crate) wants_event: bool,
    pub(crate) tick: bool,
    pub(crate) owner: RwLock<Weak<ManagerInner>>,
    func: HandlerFn,
}

impl Handler {
    /// Create a handler with default metadata: any event name, inherited
    /// channel, priority 0, not a filter, no event argument, not a tick.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(HandlerCall<'_>) -> anyhow::Result<HandlerReturn> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: HANDLER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            names: Vec::new(),
            channel: None,
            priority: 0.0,
            filter: false,
            wants_event: false,
            tick: false,
            owner: RwLock::new(Weak::new()),
            func: Arc::new(func),
        }
    }

    // -- builder ------------------------------------------------------------

    /// Add an event name this handler responds to.
    pub fn on(mut self, event_name: impl Into<String>) -> Self {
        self.names.push(event_name.into());
        self
    }

    /// Set an explicit channel (otherwise the owner's channel applies).
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the priority; higher priorities run first.
    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as a filter: a truthy return suppresses remaining handlers.
    pub fn filter(mut self, yes: bool) -> Self {
        self.filter = yes;
        self
    }

    /// Request the event handle as part of the invocation.
    pub fn with_event(mut self, yes: bool) -> Self {
        self.wants_event = yes;
        self
    }

    /// Also register this handler as a periodic tick source.
    pub fn tick(mut self, yes: bool) -> Self {
        self.tick = yes;
        self
    }

    // -- accessors ----------------------------------------------------------

    /// Unique handler id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name, used in logs and `error` events.
    pub fn name(&self) -> &str {
        &self.name
    }

    // -- binding ------------------------------------------------------------

    pub(crate) fn bind(&self, owner: &Manager) {
        *self.owner.write() = owner.downgrade();
    }

    pub(crate) fn owner(&self) -> Option<Manager> {
        self.owner.read().upgrade().map(Manager::from_arc)
    }

    /// The channel this handler listens on: its own, else its owner's.
    pub(crate) fn effective_channel(&self) -> Option<String> {
        if self.channel.is_some() {
            return self.channel.clone();
        }
        self.owner().and_then(|owner| owner.channel().map(String::from))
    }

    // -- invocation ---------------------------------------------------------

    /// Invoke the callable, containing panics. Returns the handler's
    /// result, or an error for both failures and panics.
    pub(crate) fn invoke(
        &self,
        event: Option<&Event>,
        args: &[Arg],
        kwargs: &HashMap<String, Arg>,
    ) -> anyhow::Result<HandlerReturn> {
        let manager = self
            .owner()
            .ok_or_else(|| anyhow!("handler '{}' has no live owner", self.name))?;
        let event = if self.wants_event { event } else { None };
        let call = HandlerCall {
            manager,
            event,
            args,
            kwargs,
        };
        match catch_unwind(AssertUnwindSafe(|| (self.func)(call))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!(
                "handler '{}' panicked: {}",
                self.name,
                panic_message(&payload)
            )),
        }
    }

    /// Invoke as a tick source: no event, empty payload, result discarded.
    pub(crate) fn invoke_tick(&self) -> anyhow::Result<()> {
        self.invoke(None, &[], &EMPTY_KWARGS).map(|_| ())
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handler({}:{} names={:?} channel={:?} priority={} filter={})",
            self.id, self.name, self.names, self.channel, self.priority, self.filter
        )
    }
}
