//! Adapting an external event source into a [`Handle`] (§4.6).
//!
//! The specification frames this around a toolkit's signal/slot connection;
//! that connection mechanism itself is out of scope here (§1 Non-goals) — a
//! caller brings their own event source and implements [`SignalSource`] over
//! it. `observe_signal` settles the returned handle on first emission and
//! detaches from the source immediately after (§4.6 "first-emission wins").

use crate::deferred::Deferred;
use crate::handle::Handle;

/// A one-shot external event source an observed [`Handle`] can be adopted
/// from (§4.6). Implementations model a toolkit signal, a channel receiver,
/// or any other "eventually fires with a value, or never" source.
pub trait SignalSource<A>: Send + 'static {
    /// Connect to the source. `on_emit` must be invoked at most once, with
    /// the emitted value; `on_destroyed` must be invoked if the source is
    /// torn down before ever emitting, so the returned handle can settle
    /// `Cancelled` rather than hang forever (§4.6 "source destroyed before
    /// emission").
    fn connect(
        self: Box<Self>,
        on_emit: Box<dyn FnOnce(A) + Send>,
        on_destroyed: Box<dyn FnOnce() + Send>,
    );
}

/// Adopts a [`SignalSource`] as a `Handle` that settles on the source's
/// first emission (§4.6).
pub fn observe_signal<A: Clone + Send + 'static>(source: impl SignalSource<A>) -> Handle<A> {
    let deferred: Deferred<A> = Deferred::new();
    let handle = deferred.handle();

    let deferred = std::sync::Arc::new(deferred);
    let on_destroyed_deferred = deferred.clone();
    Box::new(source).connect(
        Box::new(move |value| deferred.complete(value)),
        Box::new(move || on_destroyed_deferred.cancel()),
    );

    handle
}
