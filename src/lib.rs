#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![forbid(unsafe_op_in_unsafe_fn)]

//! Wayland client windowing and input backend for media applications.
//!
//! The crate brings up a window on a Wayland compositor and translates the
//! protocol's input and output events into a small portable event model,
//! delivered to an application-provided [`EventSink`] from a single thread.
//!
//! The building blocks:
//!
//! - [`backend::Backend`] performs bring-up (connect, bind globals, map the
//!   window, settle input devices) and owns the pump.
//! - A background [`poll::PollThread`] waits on the compositor socket; which
//!   half of the work it performs is decided by the [`DispatchMode`]: the
//!   threaded discipline dispatches callbacks on that thread and defers
//!   payloads to the main thread, the read-guard discipline only ingests
//!   bytes and dispatches everything on the main thread.
//! - [`event_loop::EventLoop::dispatch`] is the main-thread pump; it also
//!   drives the repeat timers the keyboard processor arms.
//!
//! Everything protocol-facing lives in the wrapper modules ([`output`],
//! [`window`], [`seat`], [`input`]); the application only ever sees the
//! types in [`event`].

pub mod backend;
pub mod connection;
pub mod event;
pub mod event_loop;
pub mod input;
pub mod keymap;
pub mod output;
pub mod poll;
pub mod registry;
pub mod seat;
mod state;
mod strategy;
pub mod window;

pub use backend::{Backend, BackendError, Options};
pub use event::{Button, Event, EventSink, Key, Modifiers};
pub use strategy::DispatchMode;

/// Routes `tracing` output of the crate's tests through the test harness,
/// filtered by `RUST_LOG`. Safe to call from every test; only the first call
/// installs the subscriber.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
