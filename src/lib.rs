#![warn(missing_docs)]
//! A composable, runtime-independent library for asynchronous values.
//!
//! `deferred-future` is a small abstraction for values that arrive later:
//! obtain a [`Handle`] to a value that will complete (or be cancelled),
//! chain transformations onto it with [`Handle::subscribe`]/
//! [`Handle::context`], aggregate many handles into one with [`Combinator`],
//! and drive completion from imperative code with the producer-side
//! [`Deferred`]. It does not own a thread pool or an event loop; callbacks
//! run either inline (for internal bookkeeping) or posted onto a
//! [`context::Context`] lane, and a caller embedding this crate in a real
//! event loop supplies their own.
//!
//! ## Chaining
//!
//! ```
//! use deferred_future::{deferred, Deferred};
//!
//! let d: Deferred<i32> = deferred();
//! let handle = d.handle();
//! let doubled = handle.then(|x| x * 2);
//! d.complete(21);
//! assert_eq!(doubled.result().unwrap(), 42);
//! ```
//!
//! ## Combining
//!
//! ```
//! use deferred_future::{combine, Deferred, Mode};
//!
//! let a: Deferred<i32> = Deferred::new();
//! let b: Deferred<i32> = Deferred::new();
//! let c = combine(Mode::AllSettled);
//! c.push(a.handle());
//! c.push(b.handle());
//! let aggregate = c.handle();
//! a.complete(1);
//! b.complete(2);
//! assert!(aggregate.wait_for_finished(None));
//! ```
//!
//! ## Logging
//!
//! This crate uses the [`log`](https://docs.rs/log) crate for diagnostics of
//! shared-state transitions and dropped-without-completing deferreds. Enable
//! a `log` backend such as [`env_logger`](https://docs.rs/env_logger) and set
//! `RUST_LOG=deferred_future=debug` to see it.

mod status;
mod value;
mod progress;
mod context;
mod error;
mod shared_state;

pub mod handle;
pub mod deferred;
pub mod engine;
pub mod combinator;
pub mod signal;
pub mod restarter;

pub use combinator::{Combinator, Mode};
pub use context::{main_context, Context, ContextRef};
pub use deferred::Deferred;
pub use error::{ApiMisuseError, Cause, Error, ErrorKind};
pub use handle::Handle;
pub use progress::ProgressWindow;
pub use restarter::Restarter;
pub use signal::{observe_signal, SignalSource};
pub use status::Status;
pub use value::Void;

use std::time::Duration;

/// Creates a new `Deferred<T>` (§6 `deferred<T>()`).
pub fn deferred<T: Send + 'static>() -> Deferred<T> {
    Deferred::new()
}

/// Starts a new aggregate under `mode` (§6 `combine(mode)`). Add children
/// with [`Combinator::push`] or the `<<` operator.
pub fn combine<T: Clone + Send + 'static>(mode: Mode) -> Combinator<T> {
    Combinator::new(mode)
}

/// Returns `handle` unchanged; the crate has no distinct `Observable` type
/// from `Handle` (§6 `observe(handle)`).
pub fn observe<T>(handle: Handle<T>) -> Handle<T> {
    handle
}

/// Blocks until `handle` reaches a terminal status or `timeout` elapses;
/// returns whether terminal was reached (§6 `wait_for_finished`).
pub fn wait_for_finished<T: Send + 'static>(handle: &Handle<T>, timeout: Option<Duration>) -> bool {
    handle.wait_for_finished(timeout)
}

/// A pre-terminal handle that has already succeeded with `value` (§6
/// `completed(value)`). Progress is reported at its full range, `(0, 1)` at
/// `1/1`, matching a single already-available result (§11).
pub fn completed<T: Send + 'static>(value: T) -> Handle<T> {
    let d: Deferred<T> = Deferred::new();
    d.set_progress_range(0, 1);
    d.set_progress_value(1);
    d.complete(value);
    d.handle()
}

/// A pre-terminal handle that has already succeeded with `values` (§6
/// `completed_list(list)`). Progress is reported at `(0, len)` at `len/len`.
pub fn completed_list<T: Send + 'static>(values: Vec<T>) -> Handle<T> {
    let len = values.len() as i64;
    let d: Deferred<T> = Deferred::new();
    d.set_progress_range(0, len);
    d.set_progress_value(len);
    d.complete_list(values);
    d.handle()
}

/// A pre-terminal void handle that has already succeeded (§6 `completed()`).
pub fn completed_void() -> Handle<Void> {
    completed(Void)
}

/// Initializes the `log`/`env_logger` bridge for a test run, so the
/// `shared_state`/`deferred` trace and debug logging has somewhere to go
/// when a test is run with `RUST_LOG` set. Safe to call from more than one
/// test; only the first call installs the logger.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_is_immediately_succeeded_at_full_progress() {
        init_test_logging();
        let h = completed(7);
        assert_eq!(h.status(), Status::Succeeded);
        assert_eq!(h.result().unwrap(), 7);
        assert_eq!(h.progress().value(), 1);
        assert_eq!(h.progress().max(), 1);
    }

    #[test]
    fn completed_list_reports_full_range() {
        let h = completed_list(vec![1, 2, 3]);
        assert_eq!(h.status(), Status::Succeeded);
        assert_eq!(h.results().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(h.progress().value(), 3);
        assert_eq!(h.progress().max(), 3);
    }

    #[test]
    fn completed_void_succeeds() {
        let h = completed_void();
        assert_eq!(h.status(), Status::Succeeded);
    }
}
