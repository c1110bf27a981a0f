//! # Switchboard
//!
//! A component-oriented event dispatcher with cooperative tasks.
//!
//! Managers form a tree; the root owns the event queue, the memoized
//! handler registry, the suspended-task set and the tick loop that drives
//! everything. Handlers are first-class records with routing metadata
//! (event names, channel, priority, filter). A handler may suspend by
//! returning a coroutine, which the task runner resumes across ticks —
//! `wait_event` and `call_event` compose on top of that single primitive.
//! Producers on other threads enqueue under the manager lock and wake a
//! blocked tick loop through the `generate_events` pacing token.
//!
//! ```no_run
//! use switchboard::{Channel, Event, Handler, HandlerReturn, Manager};
//!
//! let root = Manager::new();
//! let app = Manager::with_channel("app");
//! root.register_child(&app);
//!
//! app.add_handler(
//!     Handler::new("hello", |_| Ok(HandlerReturn::value("Hello World!"))).on("hello"),
//! );
//!
//! let value = root.fire_to(Event::new("hello"), &[Channel::Target(app.clone())]);
//! root.flush();
//! assert_eq!(value.get(), Some("Hello World!".into()));
//! ```

/// Channel tokens and their cache-key projections.
pub mod channel;

/// Captured handler and task failures.
pub mod error;

/// Event records and the lifecycle events fired by the core.
pub mod event;

/// Tick-loop pacing token and the fallback waiter.
pub mod generate;

/// Handler records, metadata builder and invocation types.
pub mod handler;

/// The manager tree, dispatcher and tick loop.
pub mod manager;

/// Cooperative tasks and the suspension protocol.
pub mod task;

/// The promise handle returned by `fire`.
pub mod value;

mod signal;

// ---------------------------------------------------------------------------
// Convenience re-exports
// ---------------------------------------------------------------------------

pub use channel::{Channel, ChannelKey};
pub use error::DispatchError;
pub use event::{Arg, Event};
pub use generate::GenerateToken;
pub use handler::{Handler, HandlerCall, HandlerFn, HandlerReturn};
pub use manager::{Manager, TIMEOUT};
pub use task::{step_fn, CallValue, Coroutine, Step, StepFn};
pub use value::Value;
