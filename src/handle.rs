//! The read-only view over a shared state (§4.2).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::progress::ProgressWindow;
use crate::shared_state::SharedState;
use crate::status::Status;

/// A read-only, cheaply-cloneable view of a value that will arrive later.
///
/// Cloning a `Handle` does not duplicate the underlying work; every clone
/// observes the same shared state (§3 "ownership: shared").
pub struct Handle<T> {
    pub(crate) state: SharedState<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.state).finish()
    }
}

impl<T: Send + 'static> Handle<T> {
    pub(crate) fn from_state(state: SharedState<T>) -> Self {
        Handle { state }
    }

    /// Cancel the underlying state. Not part of the public surface: a
    /// `Handle` is read-only (§3); this is used internally by the engine,
    /// the combinator, and linked deferreds to push a cancel request
    /// upstream (§4.4 "forward a cancel request to upstream").
    pub(crate) fn request_cancel(&self) {
        self.state.cancel();
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        self.state.status()
    }

    /// `true` once the state has reached any terminal status.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// `true` if the state settled `Cancelled` or `Failed` (§7: downstream
    /// consumers see `Failed` as cancelled).
    pub fn is_cancelled(&self) -> bool {
        matches!(self.status(), Status::Cancelled | Status::Failed)
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// The current progress window.
    pub fn progress(&self) -> ProgressWindow {
        self.state.progress()
    }

    /// The full result list. Only meaningful once `status() == Succeeded`;
    /// otherwise returns the corresponding well-defined error (§4.2
    /// "legal only when Succeeded").
    pub fn results(&self) -> Result<Arc<[T]>, Error> {
        match self.status() {
            Status::Succeeded => Ok(self
                .state
                .results()
                .expect("a Succeeded state always carries a results list")),
            Status::Cancelled => Err(Error::cancelled().log_debug()),
            Status::Failed => Err(self
                .state
                .error()
                .expect("a Failed state always carries a cause")),
            Status::Pending | Status::Running => Err(Error::new(
                ErrorKind::ApiMisuse,
                "result queried before the handle settled",
            )
            .log_debug()),
        }
    }

    /// Blocks the current thread until terminal or `timeout` elapses.
    /// Returns whether terminal was reached (§4.2, §5 "the only blocking
    /// primitive").
    pub fn wait_for_finished(&self, timeout: Option<Duration>) -> bool {
        self.state.wait_for_finished(timeout)
    }
}

impl<T: Clone + Send + 'static> Handle<T> {
    /// The last reported value. Only meaningful once `status() ==
    /// Succeeded`.
    pub fn result(&self) -> Result<T, Error> {
        let values = self.results()?;
        values.last().cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::ApiMisuse,
                "succeeded handle carries no result value",
            )
        })
    }
}

/// An awaitable form of `wait_for_finished` (§4.2 "Implementations that
/// cannot block MUST provide an awaitable form with the same semantics").
/// Blocking via [`Handle::wait_for_finished`] and driving this `Future` are
/// two views onto the same underlying settle; neither owns the other.
impl<T: Clone + Send + 'static> Future for Handle<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match self.state.poll_terminal(cx) {
            Poll::Ready(()) => Poll::Ready(self.result()),
            Poll::Pending => Poll::Pending,
        }
    }
}
