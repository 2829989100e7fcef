//! Error types for the library.
//!
//! A terminal [`SharedState`][crate::shared_state::SharedState] either
//! succeeds or fails; there is no partial-success state (§7 of the
//! specification this crate implements). `Error` is what a [`Handle`][
//! crate::Handle]'s `result()` raises when the state settled `Failed`, and
//! `ApiMisuse` is rejected at construction time rather than at settlement.

use std::{fmt::Display, sync::Arc};

/// Error carried by a `Failed` shared state, or returned by an operation
/// that is rejected outright (API misuse).
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) cause: Option<Cause>,
    pub(crate) message: &'static str,
}

/// A type-erased, cloneable error cause.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            cause: None,
            message,
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation was cancelled")
    }

    pub(crate) fn failed(cause: Cause) -> Self {
        Self {
            kind: ErrorKind::Failed,
            cause: Some(cause),
            message: "continuation raised an exception",
        }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the underlying cause, if this is a `Failed` error produced by a
    /// continuation that raised an exception.
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// General category of error as part of an [`Error`] (§7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Cooperative termination without a cause.
    Cancelled,

    /// Terminated with a carried exception object. Downstream observers see
    /// this as cancelled; the cause is retrievable via [`Error::cause`].
    Failed,

    /// The call was rejected as a static API misuse rather than settled.
    ApiMisuse,
}

/// Attempting to complete a void [`Deferred`][crate::Deferred] with a
/// handle-of-handle is rejected at construction time (§4.3).
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot complete a void Deferred with a handle-of-handle: {0}")]
pub struct ApiMisuseError(pub(crate) &'static str);

impl From<ApiMisuseError> for Error {
    fn from(value: ApiMisuseError) -> Self {
        Error::new(ErrorKind::ApiMisuse, value.0)
    }
}

/// A continuation's panic payload, captured as a `Cause` (§7 "thrown
/// exception").
#[derive(Debug, Clone, thiserror::Error)]
#[error("continuation panicked: {0}")]
pub struct PanicCause(pub(crate) String);

/// Converts a `catch_unwind` payload into a `Cause`.
pub(crate) fn panic_cause(payload: Box<dyn std::any::Any + Send>) -> Cause {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    Arc::new(PanicCause(message))
}
