//! Execution lanes (§5, §9 "Signal/slot posting to a specific execution
//! lane").
//!
//! A [`Context`] is `{ post(closure) }`: the library posts observer
//! invocations onto it rather than running them inline on the thread that
//! completed a [`Deferred`][crate::Deferred] (§5 "all observer firing is
//! POSTED to the appropriate lane rather than run inline on the producer's
//! thread"). The core does not own a thread pool (§1 Non-goals); the single
//! background thread behind [`main_context`] exists only to give callbacks
//! attached without an explicit context somewhere to run, mirroring the
//! "library's main lane" `asyncfuture.h` gets for free from Qt's event
//! loop. A caller embedding this crate in a real event loop should supply
//! its own [`Context`] instead.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;

/// An execution lane a callback can be posted onto.
///
/// Implementations must run posted jobs in FIFO order and must not run a
/// job synchronously from within `post` (§5: producers may call from any
/// thread, and observer firing must never be inline on that thread).
pub trait Context: Send + Sync {
    /// Schedule `job` to run on this context's lane.
    fn post(&self, job: Box<dyn FnOnce() + Send>);
}

/// A handle to a `Context` that is either strongly or weakly held.
///
/// Observers attached without an explicit context token hold a strong
/// reference to [`main_context`]; observers attached with a caller-supplied
/// context hold only a [`Weak`] reference, so that a dead context
/// automatically detaches its observers (§5 "Lifetime invariants").
#[derive(Clone)]
pub enum ContextRef {
    /// The library-wide lane, always alive.
    Main(Arc<dyn Context>),
    /// A caller-supplied context; invalid once the last strong ref drops.
    Weak(Weak<dyn Context>),
}

impl ContextRef {
    /// The default lane used when no explicit context is supplied.
    pub fn main() -> Self {
        ContextRef::Main(main_context())
    }

    /// Wrap a caller-supplied context by weak reference.
    pub fn from_weak(ctx: &Arc<dyn Context>) -> Self {
        ContextRef::Weak(Arc::downgrade(ctx))
    }

    /// `true` if the context is still alive (main is always alive).
    pub fn is_alive(&self) -> bool {
        match self {
            ContextRef::Main(_) => true,
            ContextRef::Weak(w) => w.strong_count() > 0,
        }
    }

    /// Posts `job`, or drops it silently if the context has died.
    pub fn post(&self, job: Box<dyn FnOnce() + Send>) {
        match self {
            ContextRef::Main(ctx) => ctx.post(job),
            ContextRef::Weak(w) => {
                if let Some(ctx) = w.upgrade() {
                    ctx.post(job);
                }
            }
        }
    }
}

/// A FIFO executor backed by one dedicated background thread.
///
/// This is the documented substitute (§9 open question) for "the library's
/// main lane" on a substrate without an event loop of its own.
struct ThreadContext {
    sender: Mutex<Sender<Box<dyn FnOnce() + Send>>>,
}

impl ThreadContext {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        std::thread::Builder::new()
            .name("deferred-future-main".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn main context thread");
        Self {
            sender: Mutex::new(tx),
        }
    }
}

impl Context for ThreadContext {
    fn post(&self, job: Box<dyn FnOnce() + Send>) {
        if self.sender.lock().unwrap().send(job).is_err() {
            log::warn!("main context thread is gone; dropping posted job");
        }
    }
}

static MAIN_CONTEXT: Lazy<Arc<dyn Context>> = Lazy::new(|| Arc::new(ThreadContext::new()));

/// The library-wide default lane used for callbacks attached without an
/// explicit context (§4.4 "If `ctx = null`...").
pub fn main_context() -> Arc<dyn Context> {
    MAIN_CONTEXT.clone()
}

/// A [`Context`] that runs jobs inline, immediately, on whichever thread
/// calls `post`.
pub(crate) struct InlineContext;

impl Context for InlineContext {
    fn post(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

static INLINE_CONTEXT: Lazy<Arc<dyn Context>> = Lazy::new(|| Arc::new(InlineContext));

/// The lane used for the engine's own bookkeeping (linking a deferred to an
/// upstream handle, forwarding progress, combinator/restarter wiring) as
/// opposed to user-supplied continuation callbacks. This plumbing has no
/// lane affinity of its own; it runs synchronously on whichever thread
/// settles the upstream state, the same way the source's direct signal
/// connections chain within a single call.
pub(crate) fn inline_context() -> ContextRef {
    ContextRef::Main(INLINE_CONTEXT.clone())
}
