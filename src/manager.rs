//! The manager: event queue, handler registry, dispatcher and tick loop.
//!
//! Managers form a tree. Exactly one manager is the root of its hierarchy;
//! the root owns the live event queue, the resolved-handler cache, the task
//! set and the tick set. Child managers contribute handlers and tick
//! sources through registration, and every queue/cache/task manipulation on
//! a non-root manager delegates upward.
//!
//! `fire` appends an event to the root queue (waking a blocked tick loop
//! when called from another thread). `tick` runs tick sources, advances
//! suspended tasks, paces itself with a `generate_events` token and flushes
//! the queue. `flush` pops each queued event and runs `dispatch` over it:
//! handlers are resolved per (name, channels), ordered by (priority desc,
//! filter desc), invoked with failures captured as events, and suspensions
//! registered as tasks. Completion of an event and everything it
//! transitively triggered is tracked through `cause`/`effects` and reported
//! with a `{name}_complete` event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::channel::{Channel, ChannelKey};
use crate::error::DispatchError;
use crate::event::{Event, GENERATE_EVENTS, SIGNAL};
use crate::generate::{self, GenerateToken};
use crate::handler::{is_truthy, Handler, HandlerReturn};
use crate::signal;
use crate::task::{Coroutine, Step, TaskEntry};
use crate::task::{CallEvent, WaitEvent};
use crate::value::Value;

/// Upper wait cap for a scheduling pass while tick handlers are registered.
pub const TIMEOUT: Duration = Duration::from_millis(10);

static MANAGER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

type CacheKey = (String, Vec<ChannelKey>);

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Cheaply cloneable manager handle.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    id: u64,
    channel: Option<String>,
    parent: RwLock<Weak<ManagerInner>>,
    root: RwLock<Weak<ManagerInner>>,
    components: RwLock<Vec<Manager>>,
    handlers: RwLock<HashMap<String, Vec<Arc<Handler>>>>,
    globals: RwLock<Vec<Arc<Handler>>>,
    queue: Mutex<VecDeque<(Event, Vec<Channel>)>>,
    cache: DashMap<CacheKey, Arc<Vec<Arc<Handler>>>>,
    tasks: Mutex<Vec<TaskEntry>>,
    ticks: Mutex<Vec<Arc<Handler>>>,
    running: AtomicBool,
    executing: Mutex<Option<ThreadId>>,
    currently_handling: Mutex<Option<Event>>,
    generate_token: Mutex<Option<Arc<GenerateToken>>>,
    lock: ReentrantMutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    fallback_installed: AtomicBool,
    signal_stop_installed: AtomicBool,
}

impl Manager {
    /// Create a root manager with no channel of its own.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a manager listening on the given channel.
    pub fn with_channel(channel: impl Into<String>) -> Self {
        Self::build(Some(channel.into()))
    }

    fn build(channel: Option<String>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            id: MANAGER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            channel,
            parent: RwLock::new(weak.clone()),
            root: RwLock::new(weak.clone()),
            components: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            globals: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            cache: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            ticks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            executing: Mutex::new(None),
            currently_handling: Mutex::new(None),
            generate_token: Mutex::new(None),
            lock: ReentrantMutex::new(()),
            worker: Mutex::new(None),
            fallback_installed: AtomicBool::new(false),
            signal_stop_installed: AtomicBool::new(false),
        });
        Self { inner }
    }

    // -- identity and tree accessors ---------------------------------------

    /// Unique manager id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The channel this manager (and its unchannelled handlers) listens on.
    pub fn channel(&self) -> Option<&str> {
        self.inner.channel.as_deref()
    }

    /// The root of this manager's hierarchy (itself, if unregistered).
    pub fn root(&self) -> Manager {
        self.inner
            .root
            .read()
            .upgrade()
            .map(Manager::from_arc)
            .unwrap_or_else(|| self.clone())
    }

    /// The parent manager (itself, if unregistered).
    pub fn parent(&self) -> Manager {
        self.inner
            .parent
            .read()
            .upgrade()
            .map(Manager::from_arc)
            .unwrap_or_else(|| self.clone())
    }

    /// Whether this manager is the root of its hierarchy.
    pub fn is_root(&self) -> bool {
        self.root().inner.id == self.inner.id
    }

    /// Whether the manager has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.root().inner.running.load(Ordering::Acquire)
    }

    /// Number of events pending in the root queue.
    pub fn queued(&self) -> usize {
        self.root().inner.queue.lock().len()
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_arc(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    // -- tree wiring ---------------------------------------------------------

    /// Register `child` (and its subtree) under this manager.
    ///
    /// Events queued locally on the child are migrated into the root queue;
    /// the root's handler cache is cleared and its tick list recomputed.
    pub fn register_child(&self, child: &Manager) {
        if self.inner.id == child.inner.id {
            return;
        }
        {
            let mut components = self.inner.components.write();
            if !components.iter().any(|c| c.inner.id == child.inner.id) {
                components.push(child.clone());
            }
        }
        *child.inner.parent.write() = self.downgrade();
        let root = self.root();
        child.set_root(&root);

        let migrated: Vec<(Event, Vec<Channel>)> =
            child.inner.queue.lock().drain(..).collect();
        root.inner.queue.lock().extend(migrated);

        root.inner.cache.clear();
        root.refresh_ticks();
    }

    /// Remove `child` from this manager, restoring it as the root of its
    /// own subtree.
    ///
    /// Events of the removed subtree already captured by an in-progress
    /// flush snapshot still run to completion; the cache clear guarantees
    /// no further lookups resolve into the subtree.
    pub fn unregister_child(&self, child: &Manager) {
        self.inner
            .components
            .write()
            .retain(|c| c.inner.id != child.inner.id);
        *child.inner.parent.write() = child.downgrade();
        child.set_root(&child.clone());

        let root = self.root();
        root.inner.cache.clear();
        root.refresh_ticks();
    }

    fn set_root(&self, root: &Manager) {
        *self.inner.root.write() = root.downgrade();
        let components: Vec<Manager> = self.inner.components.read().clone();
        for component in components {
            component.set_root(root);
        }
    }

    // -- handler registry ----------------------------------------------------

    /// Bind a handler to this manager and file it in the registry.
    ///
    /// Unnamed handlers on channel `"*"` go to the globals set; unnamed
    /// handlers otherwise to the name-wildcard bucket; named handlers to
    /// one bucket per name. Returns the stored handle for later removal.
    pub fn add_handler(&self, handler: Handler) -> Arc<Handler> {
        let handler = Arc::new(handler);
        handler.bind(self);

        if handler.names.is_empty() && handler.channel.as_deref() == Some("*") {
            self.inner.globals.write().push(handler.clone());
        } else if handler.names.is_empty() {
            self.inner
                .handlers
                .write()
                .entry("*".to_string())
                .or_default()
                .push(handler.clone());
        } else {
            let mut map = self.inner.handlers.write();
            for name in &handler.names {
                map.entry(name.clone()).or_default().push(handler.clone());
            }
        }

        let root = self.root();
        root.inner.cache.clear();
        root.refresh_ticks();
        handler
    }

    /// Remove a handler, either from every bucket it was filed under or —
    /// when `event` is given — from that single named bucket. Removing a
    /// handler that is not registered is a silent no-op.
    pub fn remove_handler(&self, handler: &Arc<Handler>, event: Option<&str>) {
        let names: Vec<String> = match event {
            Some(name) => vec![name.to_string()],
            None if handler.names.is_empty() => vec!["*".to_string()],
            None => handler.names.clone(),
        };
        {
            let mut map = self.inner.handlers.write();
            for name in &names {
                if let Some(bucket) = map.get_mut(name) {
                    bucket.retain(|h| h.id != handler.id);
                    if bucket.is_empty() {
                        map.remove(name);
                    }
                }
            }
        }
        if event.is_none() {
            self.inner.globals.write().retain(|h| h.id != handler.id);
        }

        let root = self.root();
        root.inner.cache.clear();
        root.refresh_ticks();
    }

    fn refresh_ticks(&self) {
        *self.inner.ticks.lock() = self.collect_ticks();
    }

    fn collect_ticks(&self) -> Vec<Arc<Handler>> {
        let mut seen = HashSet::new();
        let mut ticks: Vec<Arc<Handler>> = Vec::new();
        {
            let map = self.inner.handlers.read();
            for bucket in map.values() {
                for handler in bucket {
                    if handler.tick && seen.insert(handler.id) {
                        ticks.push(handler.clone());
                    }
                }
            }
        }
        for handler in self.inner.globals.read().iter() {
            if handler.tick && seen.insert(handler.id) {
                ticks.push(handler.clone());
            }
        }
        let components: Vec<Manager> = self.inner.components.read().clone();
        for component in components {
            for handler in component.collect_ticks() {
                if seen.insert(handler.id) {
                    ticks.push(handler);
                }
            }
        }
        ticks
    }

    // -- handler resolution --------------------------------------------------

    /// Candidate handlers of this subtree for an (event, channel) pair.
    ///
    /// A manager-instance channel targets that manager directly: its own
    /// buckets and globals are used, the channel comparison is bypassed and
    /// child components are not consulted.
    pub fn get_handlers(&self, event: &Event, channel: &Channel) -> Vec<Arc<Handler>> {
        if let Channel::Target(target) = channel {
            if target.inner.id != self.inner.id {
                return target.get_handlers(event, channel);
            }
        }
        let target_mode = matches!(channel, Channel::Target(_));
        let requested = channel.as_str();

        let candidates: Vec<Arc<Handler>> = {
            let map = self.inner.handlers.read();
            let mut candidates = Vec::new();
            if let Some(bucket) = map.get("*") {
                candidates.extend(bucket.iter().cloned());
            }
            if let Some(bucket) = map.get(event.name()) {
                candidates.extend(bucket.iter().cloned());
            }
            candidates
        };

        let mut seen = HashSet::new();
        let mut handlers = Vec::new();
        for handler in candidates {
            let effective = handler.effective_channel();
            let matched = target_mode
                || requested == Some("*")
                || effective.as_deref() == Some("*")
                || (effective.is_some() && effective.as_deref() == requested);
            if matched && seen.insert(handler.id) {
                handlers.push(handler);
            }
        }

        for handler in self.inner.globals.read().iter() {
            if seen.insert(handler.id) {
                handlers.push(handler.clone());
            }
        }

        if !target_mode {
            let components: Vec<Manager> = self.inner.components.read().clone();
            for component in components {
                for handler in component.get_handlers(event, channel) {
                    if seen.insert(handler.id) {
                        handlers.push(handler);
                    }
                }
            }
        }

        handlers
    }

    // -- firing --------------------------------------------------------------

    /// Fire an event on its default channels: the event's own, else this
    /// manager's channel, else `"*"`. Returns the installed promise.
    pub fn fire(&self, event: Event) -> Value {
        self.fire_to(event, &[])
    }

    /// Fire an event on explicit channels. Returns the installed promise.
    pub fn fire_to(&self, event: Event, channels: &[Channel]) -> Value {
        let mut channels = channels.to_vec();
        if channels.is_empty() {
            channels = event.channels();
        }
        if channels.is_empty() {
            channels = vec![self
                .inner
                .channel
                .clone()
                .map(Channel::Name)
                .unwrap_or(Channel::Any)];
        }
        event.set_channels(channels.clone());

        let value = Value::new(&event, self, event.notify());
        event.install_value(value.clone());

        self.root().enqueue(event, channels);
        value
    }

    /// Append to the root queue. Same-thread fires from inside a handler
    /// inherit the in-flight event's cause; foreign-thread fires go through
    /// the lock and cut short any pending `generate_events` wait.
    fn enqueue(&self, event: Event, channels: Vec<Channel>) {
        let same_thread =
            *self.inner.executing.lock() == Some(thread::current().id());

        if same_thread && event.name() != SIGNAL {
            let handling = self.inner.currently_handling.lock().clone();
            if let Some(current) = handling {
                if current.cause().is_some() {
                    event.set_cause(Some(current.clone()));
                    event.set_effects(1);
                    current.inc_effects();
                }
            }
            self.inner.queue.lock().push_back((event, channels));
        } else {
            let _guard = self.inner.lock.lock();
            self.inner.queue.lock().push_back((event, channels));
            let token = self.inner.generate_token.lock().clone();
            if let Some(token) = token {
                token.reduce_time_left(Duration::ZERO);
            }
        }
    }

    // -- suspension helpers --------------------------------------------------

    /// A coroutine that waits until an event named `name` has been
    /// dispatched on the given channels (all channels when empty). Yield it
    /// as a nested step from a suspended handler.
    pub fn wait_event(&self, name: &str, channels: &[Channel]) -> Box<dyn Coroutine> {
        Box::new(WaitEvent::new(self, name, channels))
    }

    /// A coroutine that fires `event`, waits until it has been dispatched,
    /// then hands its promise back to the suspended caller through the call
    /// sentinel.
    pub fn call_event(&self, event: Event, channels: &[Channel]) -> Box<dyn Coroutine> {
        Box::new(CallEvent::new(self, event, channels))
    }

    pub(crate) fn register_task(&self, entry: TaskEntry) {
        self.root().inner.tasks.lock().push(entry);
    }

    pub(crate) fn unregister_task(&self, id: u64) {
        self.root().inner.tasks.lock().retain(|entry| entry.id != id);
    }

    fn task_registered(&self, id: u64) -> bool {
        self.root().inner.tasks.lock().iter().any(|entry| entry.id == id)
    }

    // -- flush and dispatch --------------------------------------------------

    /// Dispatch every event pending in the root queue. Events fired while
    /// flushing are queued for the next flush.
    pub fn flush(&self) {
        self.root().flush_internal();
    }

    fn flush_internal(&self) {
        let me = thread::current().id();
        let set_executing = {
            let mut executing = self.inner.executing.lock();
            if executing.is_none() {
                *executing = Some(me);
                true
            } else {
                false
            }
        };

        let snapshot: Vec<(Event, Vec<Channel>)> =
            self.inner.queue.lock().drain(..).collect();
        for (event, channels) in snapshot {
            self.dispatch(&event, &channels);
        }

        if set_executing {
            *self.inner.executing.lock() = None;
        }
    }

    fn dispatch(&self, event: &Event, channels: &[Channel]) {
        *self.inner.currently_handling.lock() = Some(event.clone());
        if event.complete() {
            if event.cause().is_none() {
                event.set_cause(Some(event.clone()));
            }
            event.set_effects(1);
        }

        let key: CacheKey = (
            event.name().to_string(),
            channels.iter().map(Channel::key).collect(),
        );
        let cached = self.inner.cache.get(&key).map(|hit| hit.value().clone());
        let handlers = match cached {
            Some(list) => list,
            None => {
                let mut seen = HashSet::new();
                let mut list: Vec<Arc<Handler>> = Vec::new();
                for channel in channels {
                    for handler in self.get_handlers(event, channel) {
                        if seen.insert(handler.id) {
                            list.push(handler);
                        }
                    }
                }
                list.sort_by(|a, b| {
                    b.priority
                        .total_cmp(&a.priority)
                        .then(b.filter.cmp(&a.filter))
                });
                let list = Arc::new(list);
                self.inner.cache.insert(key, list.clone());
                list
            }
        };

        let args = event.args();
        let kwargs = event.kwargs();
        let mut error: Option<DispatchError> = None;

        for handler in handlers.iter() {
            event.set_handler(Some(handler.clone()));
            let truthy = match handler.invoke(Some(event), &args, &kwargs) {
                Err(err) => {
                    let captured = DispatchError::from_error(&err);
                    log::error!(
                        "[Manager] handler '{}' failed on '{}': {}",
                        handler.name,
                        event.name(),
                        captured
                    );
                    error = Some(captured.clone());
                    event.value().set_errors();
                    if event.failure() {
                        self.fire_to(
                            Event::failure_of(event, captured.clone()),
                            &event.channels(),
                        );
                    }
                    self.fire(Event::error(captured, Some(handler.name.clone())));
                    true
                }
                Ok(HandlerReturn::Suspend(coroutine)) => {
                    event.inc_waiting();
                    event.value().set_promise();
                    self.register_task(TaskEntry::new(event.clone(), coroutine));
                    true
                }
                Ok(HandlerReturn::Value(value)) => {
                    let truthy = is_truthy(&value);
                    event.value().set(value);
                    truthy
                }
                Ok(HandlerReturn::None) => false,
            };
            if truthy && handler.filter {
                break;
            }
        }

        *self.inner.currently_handling.lock() = None;
        self.event_done(event, error);
    }

    fn event_done(&self, event: &Event, error: Option<DispatchError>) {
        if event.waiting_handlers() > 0 {
            return;
        }

        if event.alert_done() {
            self.fire_to(Event::done_of(event), &event.channels());
        }

        if error.is_none() && event.success() {
            let channels = event
                .success_channels()
                .unwrap_or_else(|| event.channels());
            self.fire_to(Event::success_of(event), &channels);
        }

        // Walk the causation chain, collapsing every finished subtree.
        let mut current = event.clone();
        loop {
            let cause = match current.cause() {
                Some(cause) => cause,
                None => break,
            };
            if current.dec_effects() > 0 {
                break;
            }
            if current.complete() {
                let channels = current
                    .complete_channels()
                    .unwrap_or_else(|| current.channels());
                self.fire_to(Event::complete_of(&current), &channels);
            }
            current.clear_completion();
            current = cause;
        }
    }

    // -- task runner ---------------------------------------------------------

    fn process_task(&self, entry: &TaskEntry) {
        let step = {
            let mut coroutine = entry.body.lock();
            coroutine.resume(None)
        };
        match step {
            Err(err) => {
                self.unregister_task(entry.id);
                self.task_failed(&entry.event, err);
            }
            Ok(Step::Waiting) => {}
            Ok(Step::Emit(value)) => entry.event.value().set(value),
            Ok(Step::Nested(child)) => {
                entry.event.inc_waiting();
                let nested = TaskEntry::from_cells(
                    entry.event.clone(),
                    Arc::new(Mutex::new(child)),
                    Some(entry.body.clone()),
                );
                self.unregister_task(entry.id);
                self.register_task(nested.clone());
                self.process_task(&nested);
            }
            Ok(Step::Call(call)) => {
                self.unregister_task(entry.id);
                let parent = match entry.parent.clone() {
                    Some(parent) => parent,
                    None => {
                        log::warn!("[Manager] call sentinel from a task with no parent");
                        if entry.event.dec_waiting() == 0 {
                            entry.event.value().inform(true);
                            self.event_done(&entry.event, None);
                        }
                        return;
                    }
                };
                let resumed = {
                    let mut coroutine = parent.lock();
                    coroutine.resume(Some(call.0))
                };
                match resumed {
                    Err(err) => self.task_failed(&entry.event, err),
                    Ok(Step::Nested(child)) => {
                        // One yield lost, one gained: waiting count unchanged.
                        let nested = TaskEntry::from_cells(
                            entry.event.clone(),
                            Arc::new(Mutex::new(child)),
                            Some(parent),
                        );
                        self.register_task(nested.clone());
                        self.process_task(&nested);
                    }
                    Ok(other) => {
                        entry.event.dec_waiting();
                        if let Step::Emit(value) = other {
                            entry.event.value().set(value);
                        }
                        self.register_task(TaskEntry::from_cells(
                            entry.event.clone(),
                            parent,
                            None,
                        ));
                    }
                }
            }
            Ok(Step::Done) => {
                entry.event.dec_waiting();
                self.unregister_task(entry.id);
                if let Some(parent) = entry.parent.clone() {
                    self.register_task(TaskEntry::from_cells(
                        entry.event.clone(),
                        parent,
                        None,
                    ));
                } else if entry.event.waiting_handlers() == 0 {
                    entry.event.value().inform(true);
                    self.event_done(&entry.event, None);
                }
            }
        }
    }

    fn task_failed(&self, event: &Event, err: anyhow::Error) {
        let captured = DispatchError::from_error(&err);
        log::error!(
            "[Manager] task for '{}' failed: {}",
            event.name(),
            captured
        );
        let value = event.value();
        value.set_errors();
        value.inform(true);
        if event.failure() {
            self.fire_to(Event::failure_of(event, captured.clone()), &event.channels());
        }
        let handler = event.handler().map(|h| h.name().to_string());
        self.fire(Event::error(captured, handler));
    }

    // -- tick loop -----------------------------------------------------------

    /// One scheduling pass: run tick sources, advance suspended tasks,
    /// pace with a `generate_events` token (while running) and flush the
    /// queue. `timeout` bounds the pass; `None` may block until outside
    /// work arrives.
    pub fn tick(&self, timeout: Option<Duration>) {
        self.root().tick_internal(timeout);
    }

    fn tick_internal(&self, timeout: Option<Duration>) {
        let me = thread::current().id();
        let claimed = {
            let mut executing = self.inner.executing.lock();
            match *executing {
                None => {
                    *executing = Some(me);
                    true
                }
                Some(current) if current == me => false,
                // Another thread is draining; keep the single-drainer
                // invariant and skip this pass.
                Some(_) => return,
            }
        };

        let ticks: Vec<Arc<Handler>> = self.inner.ticks.lock().clone();
        for tick in ticks {
            if let Err(err) = tick.invoke_tick() {
                let captured = DispatchError::from_error(&err);
                log::error!("[Manager] tick '{}' failed: {}", tick.name(), captured);
                self.fire(Event::error(captured, Some(tick.name().to_string())));
            }
        }

        let tasks: Vec<TaskEntry> = self.inner.tasks.lock().clone();
        for entry in tasks {
            if self.task_registered(entry.id) {
                self.process_task(&entry);
            }
        }

        if self.inner.running.load(Ordering::Acquire) {
            let token = {
                let _guard = self.inner.lock.lock();
                let token = generate::token(timeout);
                if !self.inner.ticks.lock().is_empty() {
                    token.reduce_time_left(TIMEOUT);
                }
                if !self.inner.tasks.lock().is_empty() || !self.inner.queue.lock().is_empty() {
                    token.reduce_time_left(Duration::ZERO);
                }
                *self.inner.generate_token.lock() = Some(token.clone());
                token
            };
            self.ensure_fallback();
            self.fire_to(Event::generate(token), &[Channel::Any]);
        }

        if !self.inner.queue.lock().is_empty() {
            self.flush_internal();
        }

        if claimed {
            *self.inner.executing.lock() = None;
        }
    }

    fn ensure_fallback(&self) {
        if !self.inner.fallback_installed.swap(true, Ordering::AcqRel) {
            let fallback = generate::fallback_generator();
            self.register_child(&fallback);
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Drive the manager on the current thread: fire `started`, then tick
    /// until `stop()` is called and the queue has drained. When invoked on
    /// the main thread, the process signal hook is installed first.
    pub fn run(&self) {
        let root = self.root();
        if thread::current().name() == Some("main") {
            signal::install(&root);
        }
        root.ensure_signal_stop();

        *root.inner.executing.lock() = Some(thread::current().id());
        root.inner.running.store(true, Ordering::Release);
        root.fire(Event::started(&root));

        while !root.inner.queue.lock().is_empty()
            || root.inner.running.load(Ordering::Acquire)
        {
            root.tick_internal(None);
        }
        root.tick_internal(None);

        *root.inner.executing.lock() = None;
    }

    /// Spawn a worker thread executing [`run`](Self::run); returns
    /// immediately.
    pub fn start(&self) {
        let root = self.root();
        let runner = root.clone();
        match thread::Builder::new()
            .name("switchboard".to_string())
            .spawn(move || runner.run())
        {
            Ok(handle) => *root.inner.worker.lock() = Some(handle),
            Err(err) => log::error!("[Manager] failed to spawn worker thread: {err}"),
        }
    }

    /// Wait for a worker spawned by [`start`](Self::start) to finish.
    pub fn join(&self) {
        let handle = self.root().inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[Manager] worker thread panicked");
            }
        }
    }

    /// Stop the manager: strip pending `generate_events` tokens so
    /// shutdown is not re-delayed, fire `stopped`, and tick three times to
    /// drain in-flight work.
    pub fn stop(&self) {
        let root = self.root();
        if !root.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut queue = root.inner.queue.lock();
            queue.retain(|(event, _)| event.name() != GENERATE_EVENTS);
        }
        root.fire(Event::stopped(&root));
        for _ in 0..3 {
            root.tick_internal(None);
        }
    }

    fn ensure_signal_stop(&self) {
        if self.inner.signal_stop_installed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.add_handler(
            Handler::new("signal_stop", |call| {
                call.manager.stop();
                Ok(HandlerReturn::None)
            })
            .on(SIGNAL),
        );
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Manager {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Manager {}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = self
            .inner
            .channel
            .as_deref()
            .map(|c| format!("/{c}"))
            .unwrap_or_default();
        let state = if self.is_running() { "R" } else { "S" };
        write!(
            f,
            "<Manager{} {} (queued={}) [{}]>",
            channel,
            self.inner.id,
            self.queued(),
            state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::step_fn;
    use anyhow::anyhow;
    use serde_json::{json, Value as Json};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn pump(manager: &Manager, passes: usize) {
        for _ in 0..passes {
            manager.tick(Some(Duration::ZERO));
        }
    }

    fn collect(manager: &Manager, name: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.add_handler(
            Handler::new("collect", move |call| {
                if let Some(event) = call.event {
                    sink.lock().push(event.clone());
                }
                Ok(HandlerReturn::None)
            })
            .on(name)
            .channel("*")
            .with_event(true),
        );
        seen
    }

    fn counter(manager: &Manager, name: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = count.clone();
        manager.add_handler(
            Handler::new("count", move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReturn::None)
            })
            .on(name)
            .channel("*"),
        );
        count
    }

    // -- scenario: direct targeting ------------------------------------------

    #[test]
    fn test_direct_targeting() {
        let root = Manager::new();
        let app = Manager::with_channel("app");
        root.register_child(&app);
        app.add_handler(
            Handler::new("hello", |_| Ok(HandlerReturn::value("Hello World!"))).on("hello"),
        );
        let successes = collect(&app, "hello_success");

        let value = root.fire_to(
            Event::new("hello").with_success(true),
            &[Channel::Target(app.clone())],
        );
        pump(&root, 3);

        assert_eq!(value.get(), Some(json!("Hello World!")));
        assert_eq!(successes.lock().len(), 1);
    }

    #[test]
    fn test_targeting_skips_other_components() {
        let root = Manager::new();
        let app = Manager::with_channel("app");
        let other = Manager::with_channel("other");
        root.register_child(&app);
        root.register_child(&other);
        let hit = counter(&app, "ping");
        let missed = counter(&other, "ping");

        root.fire_to(Event::new("ping"), &[Channel::Target(app.clone())]);
        pump(&root, 2);

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(missed.load(Ordering::SeqCst), 0);
    }

    // -- scenario: wait by name ----------------------------------------------

    #[test]
    fn test_wait_event_by_name() {
        let root = Manager::new();
        root.add_handler(
            Handler::new("bar", |call| {
                call.manager.fire(Event::new("bar_done"));
                Ok(HandlerReturn::value("Foobar!"))
            })
            .on("bar"),
        );
        root.add_handler(
            Handler::new("test_wait", move |call| {
                let manager = call.manager.clone();
                let value = manager.fire(Event::new("bar"));
                let mut stage = 0;
                Ok(HandlerReturn::suspend(step_fn(move |_| {
                    stage += 1;
                    match stage {
                        1 => Ok(Step::Nested(
                            manager.wait_event("bar_done", &[Channel::Any]),
                        )),
                        2 => Ok(Step::Emit(value.get().unwrap_or(Json::Null))),
                        _ => Ok(Step::Done),
                    }
                })))
            })
            .on("foo"),
        );
        let observed = collect(&root, "bar_done");

        let value = root.fire(Event::new("foo"));
        pump(&root, 12);

        assert!(value.is_promise());
        assert!(value.is_informed());
        assert_eq!(value.get(), Some(json!("Foobar!")));
        assert_eq!(observed.lock().len(), 1);
        // The ephemeral wait handlers are gone again.
        let map = root.inner.handlers.read();
        assert!(!map.contains_key("bar_done_done"));
        assert_eq!(map.get("bar_done").map(|b| b.len()), Some(1));
    }

    // -- scenario: wait by instance ------------------------------------------

    #[test]
    fn test_wait_event_by_instance() {
        let root = Manager::new();
        root.add_handler(
            Handler::new("bar2", |call| {
                if let Some(done) = call.args.first().and_then(|arg| arg.as_event()) {
                    call.manager.fire(done.clone());
                }
                Ok(HandlerReturn::value("Foobar!"))
            })
            .on("bar2"),
        );
        root.add_handler(
            Handler::new("test_wait_instance", move |call| {
                let manager = call.manager.clone();
                let done = call
                    .args
                    .first()
                    .and_then(|arg| arg.as_event())
                    .cloned()
                    .ok_or_else(|| anyhow!("missing awaited event"))?;
                let name = done.name().to_string();
                let value = manager.fire(Event::new("bar2").with_arg(done));
                let mut stage = 0;
                Ok(HandlerReturn::suspend(step_fn(move |_| {
                    stage += 1;
                    match stage {
                        1 => Ok(Step::Nested(manager.wait_event(&name, &[Channel::Any]))),
                        2 => Ok(Step::Emit(value.get().unwrap_or(Json::Null))),
                        _ => Ok(Step::Done),
                    }
                })))
            })
            .on("foo2"),
        );
        let observed = collect(&root, "done_marker");

        let marker = Event::new("done_marker");
        let value = root.fire(Event::new("foo2").with_arg(marker.clone()));
        pump(&root, 12);

        assert_eq!(value.get(), Some(json!("Foobar!")));
        let seen = observed.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], marker);
    }

    // -- scenario: call_event ------------------------------------------------

    #[test]
    fn test_call_event_resolves_called_promise() {
        let root = Manager::new();
        root.add_handler(
            Handler::new("add", |call| {
                let a = call.args[0].as_json().and_then(Json::as_i64).unwrap_or(0);
                let b = call.args[1].as_json().and_then(Json::as_i64).unwrap_or(0);
                Ok(HandlerReturn::value(a + b))
            })
            .on("add"),
        );
        root.add_handler(
            Handler::new("compute", move |call| {
                let manager = call.manager.clone();
                let mut stage = 0;
                Ok(HandlerReturn::suspend(step_fn(move |input| {
                    stage += 1;
                    match stage {
                        1 => Ok(Step::Nested(manager.call_event(
                            Event::new("add").with_arg(json!(19)).with_arg(json!(23)),
                            &[],
                        ))),
                        2 => {
                            let result = input
                                .and_then(|value| value.get())
                                .unwrap_or(Json::Null);
                            Ok(Step::Emit(result))
                        }
                        _ => Ok(Step::Done),
                    }
                })))
            })
            .on("compute"),
        );

        let value = root.fire(Event::new("compute"));
        pump(&root, 15);

        assert_eq!(value.get(), Some(json!(42)));
        assert!(value.is_informed());
        assert!(root.inner.tasks.lock().is_empty());
    }

    // -- scenario: filter short-circuit --------------------------------------

    #[test]
    fn test_filter_short_circuit() {
        let root = Manager::new();
        let reached = Arc::new(AtomicUsize::new(0));
        root.add_handler(
            Handler::new("gate", |_| Ok(HandlerReturn::value(true)))
                .on("ping")
                .priority(10.0)
                .filter(true),
        );
        let bump = reached.clone();
        root.add_handler(
            Handler::new("unreached", move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReturn::value("unreached"))
            })
            .on("ping")
            .priority(1.0),
        );

        let value = root.fire(Event::new("ping"));
        root.flush();

        assert_eq!(value.get(), Some(json!(true)));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_falsy_filter_return_does_not_short_circuit() {
        let root = Manager::new();
        let reached = counter(&root, "ping");
        root.add_handler(
            Handler::new("gate", |_| Ok(HandlerReturn::value(false)))
                .on("ping")
                .priority(10.0)
                .filter(true),
        );

        root.fire(Event::new("ping"));
        root.flush();

        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    // -- scenario: completion tree -------------------------------------------

    #[test]
    fn test_completion_tree_fires_once_after_all_descendants() {
        let root = Manager::new();
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        root.add_handler(
            Handler::new("on_root", move |call| {
                log.lock().push("root".to_string());
                call.manager.fire(Event::new("child1"));
                call.manager.fire(Event::new("child2"));
                Ok(HandlerReturn::None)
            })
            .on("root"),
        );
        for child in ["child1", "child2"] {
            let log = order.clone();
            root.add_handler(
                Handler::new("on_child", move |call| {
                    log.lock().push("child".to_string());
                    call.manager.fire(Event::new("grandchild"));
                    Ok(HandlerReturn::None)
                })
                .on(child),
            );
        }
        let log = order.clone();
        root.add_handler(
            Handler::new("on_grandchild", move |_| {
                log.lock().push("grandchild".to_string());
                Ok(HandlerReturn::None)
            })
            .on("grandchild"),
        );
        let log = order.clone();
        root.add_handler(
            Handler::new("on_complete", move |_| {
                log.lock().push("complete".to_string());
                Ok(HandlerReturn::None)
            })
            .on("root_complete")
            .channel("*"),
        );

        let event = Event::new("root").with_complete(true);
        root.fire(event.clone());
        pump(&root, 8);

        let order = order.lock();
        assert_eq!(
            order.iter().filter(|entry| *entry == "complete").count(),
            1
        );
        assert_eq!(order.last().map(String::as_str), Some("complete"));
        assert_eq!(
            order.iter().filter(|entry| *entry == "grandchild").count(),
            2
        );
        // Completion state is dropped once the tree collapses.
        assert!(event.cause().is_none());
        assert_eq!(event.effects(), 0);
    }

    // -- scenario: error isolation -------------------------------------------

    #[test]
    fn test_error_isolation() {
        let root = Manager::new();
        let errors = collect(&root, "error");
        let failures = collect(&root, "op_failure");
        root.add_handler(
            Handler::new("broken", |_| Err(anyhow!("boom")))
                .on("op")
                .priority(10.0),
        );
        root.add_handler(
            Handler::new("sound", |_| Ok(HandlerReturn::value("ok")))
                .on("op")
                .priority(1.0),
        );

        let value = root.fire(Event::new("op").with_failure(true));
        pump(&root, 3);

        assert!(value.has_errors());
        assert_eq!(value.get(), Some(json!("ok")));
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(failures.lock().len(), 1);
        let failure_args = failures.lock()[0].args();
        assert!(failure_args[1].as_error().unwrap().message.contains("boom"));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let root = Manager::new();
        let errors = collect(&root, "error");
        root.add_handler(Handler::new("explosive", |_| panic!("kaboom")).on("op"));

        let value = root.fire(Event::new("op"));
        pump(&root, 2);

        assert!(value.has_errors());
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        let captured = errors[0].args()[0].as_error().unwrap().clone();
        assert!(captured.message.contains("kaboom"));
    }

    #[test]
    fn test_failed_filter_short_circuits() {
        let root = Manager::new();
        let reached = counter(&root, "op");
        root.add_handler(
            Handler::new("broken_gate", |_| Err(anyhow!("boom")))
                .on("op")
                .priority(10.0)
                .filter(true),
        );

        root.fire(Event::new("op"));
        pump(&root, 2);

        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    // -- ordering and cache --------------------------------------------------

    #[test]
    fn test_priority_ordering() {
        let root = Manager::new();
        let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        for priority in [1.0, 10.0, 5.0] {
            let log = order.clone();
            root.add_handler(
                Handler::new("ordered", move |_| {
                    log.lock().push(priority as i32);
                    Ok(HandlerReturn::None)
                })
                .on("ev")
                .priority(priority),
            );
        }
        root.fire(Event::new("ev"));
        root.flush();
        assert_eq!(*order.lock(), vec![10, 5, 1]);
    }

    #[test]
    fn test_filter_breaks_priority_ties() {
        let root = Manager::new();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log = order.clone();
        root.add_handler(
            Handler::new("plain", move |_| {
                log.lock().push("plain");
                Ok(HandlerReturn::None)
            })
            .on("ev"),
        );
        let log = order.clone();
        root.add_handler(
            Handler::new("filtering", move |_| {
                log.lock().push("filter");
                Ok(HandlerReturn::None)
            })
            .on("ev")
            .filter(true),
        );
        root.fire(Event::new("ev"));
        root.flush();
        assert_eq!(*order.lock(), vec!["filter", "plain"]);
    }

    #[test]
    fn test_cache_invalidated_on_registry_mutation() {
        let root = Manager::new();
        let first = counter(&root, "ev");
        root.fire(Event::new("ev"));
        root.flush();
        assert_eq!(first.load(Ordering::SeqCst), 1);

        // The lookup for "ev" is now cached; a new handler must still be
        // picked up by the next dispatch.
        let second = counter(&root, "ev");
        root.fire(Event::new("ev"));
        root.flush();
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_routing() {
        let root = Manager::new();
        let any_channel = counter(&root, "ev");
        let net_only = Arc::new(AtomicUsize::new(0));
        let bump = net_only.clone();
        root.add_handler(
            Handler::new("net_only", move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReturn::None)
            })
            .on("ev")
            .channel("net"),
        );

        root.fire_to(Event::new("ev"), &[Channel::name("disk")]);
        root.flush();
        assert_eq!(net_only.load(Ordering::SeqCst), 0);
        // The "*"-channelled handler sees every channel.
        assert_eq!(any_channel.load(Ordering::SeqCst), 1);

        root.fire_to(Event::new("ev"), &[Channel::name("net")]);
        root.flush();
        assert_eq!(net_only.load(Ordering::SeqCst), 1);
    }

    // -- registry round trips ------------------------------------------------

    #[test]
    fn test_add_remove_handler_round_trip() {
        let root = Manager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let bump = count.clone();
        let handler = root.add_handler(
            Handler::new("transient", move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReturn::None)
            })
            .on("ev"),
        );
        root.fire(Event::new("ev"));
        root.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        root.remove_handler(&handler, None);
        assert!(root.inner.handlers.read().is_empty());
        root.fire(Event::new("ev"));
        root.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Removing again is a tolerated no-op.
        root.remove_handler(&handler, None);
    }

    #[test]
    fn test_global_handler_round_trip() {
        let root = Manager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let bump = count.clone();
        let handler = root.add_handler(
            Handler::new("global", move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReturn::None)
            })
            .channel("*"),
        );
        assert_eq!(root.inner.globals.read().len(), 1);

        root.fire(Event::new("anything"));
        root.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        root.remove_handler(&handler, None);
        assert!(root.inner.globals.read().is_empty());
        root.fire(Event::new("anything"));
        root.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_child_migrates_queue() {
        let root = Manager::new();
        let child = Manager::new();
        let count = counter(&child, "queued_early");

        // Fired while unregistered: queued locally on the child.
        child.fire(Event::new("queued_early"));
        assert_eq!(child.inner.queue.lock().len(), 1);

        root.register_child(&child);
        assert!(child.inner.queue.lock().is_empty());
        assert_eq!(root.inner.queue.lock().len(), 1);

        root.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(child.root(), root);

        root.unregister_child(&child);
        assert_eq!(child.root(), child);
        root.fire(Event::new("queued_early"));
        root.flush();
        // Dispatched exactly once: the unregistered subtree is not resolved.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // -- tick sources --------------------------------------------------------

    #[test]
    fn test_tick_handlers_run_each_pass() {
        let root = Manager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let bump = count.clone();
        root.add_handler(
            Handler::new("poller", move |_| {
                bump.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReturn::None)
            })
            .on("never_fired")
            .tick(true),
        );
        pump(&root, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failing_tick_becomes_error_event() {
        let root = Manager::new();
        let errors = collect(&root, "error");
        root.add_handler(
            Handler::new("bad_poller", |_| Err(anyhow!("poll failed")))
                .on("never_fired")
                .tick(true),
        );
        pump(&root, 1);
        assert_eq!(errors.lock().len(), 1);
    }

    // -- lifecycle and threads -----------------------------------------------

    #[test]
    fn test_cross_thread_fire_wakes_blocked_loop() {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = Manager::new();
        let count = counter(&root, "poke");
        let started_events = collect(&root, "started");
        root.start();

        // Let the worker enter its unbounded generate wait.
        let deadline = Instant::now() + Duration::from_secs(5);
        while started_events.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));

        root.fire(Event::new("poke"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        root.stop();
        root.join();
        assert!(!root.is_running());
    }

    #[test]
    fn test_firing_during_stop_still_drains() {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = Manager::new();
        let after = collect(&root, "after_stop");
        root.add_handler(
            Handler::new("on_stopped", |call| {
                call.manager.fire(Event::new("after_stop"));
                Ok(HandlerReturn::None)
            })
            .on("stopped")
            .channel("*"),
        );
        root.add_handler(
            Handler::new("kill", |call| {
                call.manager.stop();
                Ok(HandlerReturn::None)
            })
            .on("kill"),
        );

        root.start();
        root.fire(Event::new("kill"));
        root.join();

        assert_eq!(after.lock().len(), 1);
        assert!(!root.is_running());
    }

    #[test]
    fn test_signal_event_stops_running_manager() {
        let root = Manager::new();
        let stopped = collect(&root, "stopped");
        root.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !root.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        root.fire(Event::signal());
        root.join();

        assert!(!root.is_running());
        assert_eq!(stopped.lock().len(), 1);
    }

    #[test]
    fn test_event_done_waits_for_suspended_handlers() {
        let root = Manager::new();
        let dones = collect(&root, "slow_done");
        root.add_handler(
            Handler::new("slow", |call| {
                if let Some(event) = call.event {
                    event.set_alert_done(true);
                }
                let mut polls = 0;
                Ok(HandlerReturn::suspend(step_fn(move |_| {
                    polls += 1;
                    if polls < 3 {
                        Ok(Step::Waiting)
                    } else {
                        Ok(Step::Done)
                    }
                })))
            })
            .on("slow")
            .with_event(true),
        );

        let value = root.fire(Event::new("slow"));
        root.flush();
        // Still suspended: no done event yet.
        assert!(value.is_promise());
        assert!(dones.lock().is_empty());
        pump(&root, 5);
        assert_eq!(dones.lock().len(), 1);
        assert!(value.is_informed());
        assert!(root.inner.tasks.lock().is_empty());
    }

    #[test]
    fn test_failing_task_unregisters_and_reports() {
        let root = Manager::new();
        let errors = collect(&root, "error");
        root.add_handler(
            Handler::new("doomed", |_| {
                Ok(HandlerReturn::suspend(step_fn(|_| Err(anyhow!("mid-task")))))
            })
            .on("doomed"),
        );

        let value = root.fire(Event::new("doomed").with_failure(true));
        let failures = collect(&root, "doomed_failure");
        root.flush();
        pump(&root, 3);

        assert!(value.has_errors());
        assert!(value.is_informed());
        assert!(root.inner.tasks.lock().is_empty());
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(failures.lock().len(), 1);
    }
}
