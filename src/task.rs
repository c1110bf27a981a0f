//! Cooperative tasks: suspended handlers resumed across ticks.
//!
//! A handler suspends by returning [`HandlerReturn::Suspend`] with a
//! [`Coroutine`]. The task runner advances each registered coroutine one
//! [`Step`] per tick:
//!
//! - [`Step::Waiting`] — nothing this pass, poll again next tick.
//! - [`Step::Emit`] — an intermediate result, assigned to the event value.
//! - [`Step::Nested`] — a sub-coroutine to run to completion first.
//! - [`Step::Call`] — the call sentinel ending a `call_event`; its promise
//!   is sent back into the parent coroutine.
//! - [`Step::Done`] — exhausted. Finished coroutines are fused: resuming
//!   again must keep returning `Done`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::event::Event;
use crate::handler::{Handler, HandlerReturn};
use crate::manager::Manager;
use crate::value::Value;

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Steps and the coroutine trait
// ---------------------------------------------------------------------------

/// Sentinel yielded when a `call_event` has been dispatched; carries the
/// promise of the called event.
pub struct CallValue(pub Value);

/// One resumption result of a suspended handler.
pub enum Step {
    /// No progress this pass.
    Waiting,
    /// An intermediate (or final) plain result.
    Emit(serde_json::Value),
    /// A nested sub-coroutine; the runner registers it with the current
    /// coroutine as its parent.
    Nested(Box<dyn Coroutine>),
    /// End of a `call_event` composition.
    Call(CallValue),
    /// Exhausted.
    Done,
}

/// A suspended handler that can be advanced one step at a time.
///
/// `input` carries the promise of a completed `call_event` when the runner
/// resumes a parent coroutine with its result; plain polls pass `None`.
pub trait Coroutine: Send {
    fn resume(&mut self, input: Option<Value>) -> anyhow::Result<Step>;
}

/// Adapter lifting a closure into a coroutine, for handlers written as
/// small explicit state machines.
pub struct StepFn<F> {
    func: F,
}

impl<F> Coroutine for StepFn<F>
where
    F: FnMut(Option<Value>) -> anyhow::Result<Step> + Send,
{
    fn resume(&mut self, input: Option<Value>) -> anyhow::Result<Step> {
        (self.func)(input)
    }
}

/// Box a closure as a [`Coroutine`].
pub fn step_fn<F>(func: F) -> Box<dyn Coroutine>
where
    F: FnMut(Option<Value>) -> anyhow::Result<Step> + Send + 'static,
{
    Box::new(StepFn { func })
}

// ---------------------------------------------------------------------------
// Task registration entries
// ---------------------------------------------------------------------------

pub(crate) type CoroutineCell = Arc<Mutex<Box<dyn Coroutine>>>;

/// A registered task: `(event, coroutine)` with an optional parent
/// coroutine for `call_event` composition. Entries are identified by id so
/// registration and removal are exact.
#[derive(Clone)]
pub(crate) struct TaskEntry {
    pub(crate) id: u64,
    pub(crate) event: Event,
    pub(crate) body: CoroutineCell,
    pub(crate) parent: Option<CoroutineCell>,
}

impl TaskEntry {
    pub(crate) fn new(event: Event, body: Box<dyn Coroutine>) -> Self {
        Self::from_cells(event, Arc::new(Mutex::new(body)), None)
    }

    pub(crate) fn from_cells(
        event: Event,
        body: CoroutineCell,
        parent: Option<CoroutineCell>,
    ) -> Self {
        Self {
            id: TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            event,
            body,
            parent,
        }
    }
}

// ---------------------------------------------------------------------------
// WaitEvent — suspend until a named event has been dispatched
// ---------------------------------------------------------------------------

struct WaitState {
    seen: bool,
    flag: bool,
    event: Option<Event>,
    on_event: Vec<Arc<Handler>>,
    on_done: Vec<Arc<Handler>>,
}

/// Coroutine behind `Manager::wait_event`: installs two ephemeral handlers
/// — one on the awaited name that records the event and requests its
/// `{name}_done`, one on the `_done` name that flips the completion flag —
/// then waits until the flag is set.
pub(crate) struct WaitEvent {
    manager: Manager,
    name: String,
    channels: Vec<Channel>,
    state: Arc<Mutex<WaitState>>,
    installed: bool,
}

impl WaitEvent {
    pub(crate) fn new(manager: &Manager, name: &str, channels: &[Channel]) -> Self {
        Self {
            manager: manager.clone(),
            name: name.to_string(),
            channels: channels.to_vec(),
            state: Arc::new(Mutex::new(WaitState {
                seen: false,
                flag: false,
                event: None,
                on_event: Vec::new(),
                on_done: Vec::new(),
            })),
            installed: false,
        }
    }

    fn handler_channel(channel: &Channel) -> String {
        match channel {
            Channel::Any => "*".to_string(),
            Channel::Name(name) => name.clone(),
            Channel::Target(manager) => manager
                .channel()
                .map(String::from)
                .unwrap_or_else(|| "*".to_string()),
        }
    }

    fn install(&self) {
        let done_name = format!("{}_done", self.name);
        let channels: Vec<String> = if self.channels.is_empty() {
            vec!["*".to_string()]
        } else {
            self.channels.iter().map(Self::handler_channel).collect()
        };

        for channel in &channels {
            let state = self.state.clone();
            let on_event = Handler::new("wait_on_event", move |call| {
                let to_remove = {
                    let mut st = state.lock();
                    if st.seen {
                        Vec::new()
                    } else {
                        st.seen = true;
                        if let Some(event) = call.event {
                            event.set_alert_done(true);
                            st.event = Some(event.clone());
                        }
                        std::mem::take(&mut st.on_event)
                    }
                };
                for handler in to_remove {
                    call.manager.remove_handler(&handler, None);
                }
                Ok(HandlerReturn::None)
            })
            .on(self.name.clone())
            .channel(channel.clone())
            .with_event(true);

            let state = self.state.clone();
            let on_done = Handler::new("wait_on_done", move |call| {
                if let Some(source) = call.args.first().and_then(|arg| arg.as_event()) {
                    let mut st = state.lock();
                    if st.event.as_ref() == Some(source) {
                        st.flag = true;
                    }
                }
                Ok(HandlerReturn::None)
            })
            .on(done_name.clone())
            .channel(channel.clone());

            let on_event = self.manager.add_handler(on_event);
            let on_done = self.manager.add_handler(on_done);
            let mut st = self.state.lock();
            st.on_event.push(on_event);
            st.on_done.push(on_done);
        }
    }
}

impl Coroutine for WaitEvent {
    fn resume(&mut self, _input: Option<Value>) -> anyhow::Result<Step> {
        if !self.installed {
            self.install();
            self.installed = true;
        }
        let finished = self.state.lock().flag;
        if !finished {
            return Ok(Step::Waiting);
        }
        let leftovers = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.on_done)
        };
        for handler in leftovers {
            self.manager.remove_handler(&handler, None);
        }
        Ok(Step::Done)
    }
}

// ---------------------------------------------------------------------------
// CallEvent — fire, wait for dispatch, hand the promise to the parent
// ---------------------------------------------------------------------------

/// Coroutine behind `Manager::call_event`: fires the event on first
/// resumption, waits until it has been dispatched, then yields the call
/// sentinel carrying the promise.
pub(crate) struct CallEvent {
    manager: Manager,
    pending: Option<(Event, Vec<Channel>)>,
    wait: Option<WaitEvent>,
    value: Option<Value>,
    finished: bool,
}

impl CallEvent {
    pub(crate) fn new(manager: &Manager, event: Event, channels: &[Channel]) -> Self {
        Self {
            manager: manager.clone(),
            pending: Some((event, channels.to_vec())),
            wait: None,
            value: None,
            finished: false,
        }
    }
}

impl Coroutine for CallEvent {
    fn resume(&mut self, _input: Option<Value>) -> anyhow::Result<Step> {
        if self.finished {
            return Ok(Step::Done);
        }
        if let Some((event, channels)) = self.pending.take() {
            let value = self.manager.fire_to(event.clone(), &channels);
            self.wait = Some(WaitEvent::new(
                &self.manager,
                event.name(),
                &event.channels(),
            ));
            self.value = Some(value);
        }
        let step = match &mut self.wait {
            Some(wait) => wait.resume(None)?,
            None => Step::Done,
        };
        match step {
            Step::Done => {
                self.finished = true;
                match self.value.take() {
                    Some(value) => Ok(Step::Call(CallValue(value))),
                    None => Ok(Step::Done),
                }
            }
            _ => Ok(Step::Waiting),
        }
    }
}
