//! The continuation engine: `context`/`subscribe` (§4.4, §9 "callback type
//! dispatch").
//!
//! Rust has no overloading, so the "small set of overloaded entry points"
//! the design notes call for (§9) is a small set of distinctly-named
//! methods rather than one polymorphic `context`: `context`/`subscribe` for
//! continuations that return a plain value, and `context_linking`/
//! `subscribe_linking` for continuations that return a [`Handle`] to be
//! auto-unwrapped. The 0-argument callback shape, legal only when observing
//! a void-typed handle (§6 "callback shape rules"), is a separate impl
//! block on `Handle<Void>` so the compiler enforces it statically.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::context::{inline_context, ContextRef};
use crate::error::panic_cause;
use crate::handle::Handle;
use crate::progress::ForwardedProgress;
use crate::shared_state::{SharedState, TerminalEvent};
use crate::value::Void;

/// Mirrors an upstream terminal event onto `downstream`, used both by a
/// linked `Deferred` (§4.3) and by a continuation whose callback returned a
/// `Handle` to auto-unwrap (§4.4 state 2c).
pub(crate) fn mirror_terminal<T: Clone + Send + 'static>(
    downstream: &SharedState<T>,
    event: TerminalEvent<T>,
) {
    match event {
        TerminalEvent::Succeeded(values) => {
            downstream.report_results(values.to_vec());
            downstream.report_finished();
        }
        TerminalEvent::Cancelled => {
            downstream.cancel();
        }
        TerminalEvent::Failed(err) => {
            let cause = err
                .cause()
                .cloned()
                .unwrap_or_else(|| Arc::new(std::io::Error::other(err.to_string())));
            downstream.report_exception(cause);
        }
    }
}

/// A guard ensuring a cancel callback fires at most once across redundant
/// cancel paths (§4.4 "CancelOnce").
#[derive(Clone)]
struct CancelOnce(Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>);

impl CancelOnce {
    fn new(g: impl FnOnce() + Send + 'static) -> Self {
        CancelOnce(Arc::new(Mutex::new(Some(Box::new(g)))))
    }

    fn fire(&self) {
        if let Some(g) = self.0.lock().unwrap().take() {
            g();
        }
    }
}

/// What a continuation's success callback produced: a plain value to
/// complete downstream with, or a handle to link downstream to (§4.4
/// "auto-unwrap").
enum Outcome<R> {
    Value(R),
    Linked(Handle<R>),
}

impl<T: Clone + Send + 'static> Handle<T> {
    /// `context(ctx, on_done, on_cancel)` (§4.4): `on_done` returns a plain
    /// value.
    pub fn context<R, F, G>(&self, ctx: Option<ContextRef>, on_done: F, on_cancel: G) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.context_impl(ctx, move |v| Outcome::Value(on_done(v)), on_cancel)
    }

    /// `subscribe(on_done, on_cancel)` (§4.4): `context` with the default
    /// context.
    pub fn subscribe<R, F, G>(&self, on_done: F, on_cancel: G) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.context(None, on_done, on_cancel)
    }

    /// `context(ctx, on_done, on_cancel)` where `on_done` returns a
    /// [`Handle<R>`] to link downstream to, auto-unwrapping one level
    /// (§4.4 "if R is Handle<X>, then R' = X").
    pub fn context_linking<R, F, G>(
        &self,
        ctx: Option<ContextRef>,
        on_done: F,
        on_cancel: G,
    ) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Handle<R> + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.context_impl(ctx, move |v| Outcome::Linked(on_done(v)), on_cancel)
    }

    /// `subscribe(on_done, on_cancel)` variant of [`Handle::context_linking`].
    pub fn subscribe_linking<R, F, G>(&self, on_done: F, on_cancel: G) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Handle<R> + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.context_linking(None, on_done, on_cancel)
    }

    fn context_impl<R, F, G>(&self, ctx: Option<ContextRef>, on_done: F, on_cancel: G) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<R> + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        let ctx = ctx.unwrap_or_else(ContextRef::main);
        // The engine itself is the downstream's producer; it has no
        // "dropped without completing" moment distinct from the bookkeeping
        // below, so this is plain `SharedState`, not a caller-owned
        // `Deferred` (whose `Drop` would cancel it the instant this
        // function returns, before the chain had a chance to run).
        let downstream: SharedState<R> = SharedState::new();
        let downstream_handle = Handle::from_state(downstream.clone());

        if !ctx.is_alive() {
            // §4.4 "If ctx ... becomes invalid before upstream settles,
            // downstream is Cancelled and neither f nor g are invoked."
            downstream.cancel();
            return downstream_handle;
        }

        // Downstream cancelled externally -> best-effort cancel upstream
        // (§4.4 state 4, §5 "bidirectional cancel is idempotent").
        let upstream_for_push = self.clone();
        downstream.on_terminal(inline_context(), move |event| {
            if matches!(event, TerminalEvent::Cancelled) {
                upstream_for_push.request_cancel();
            }
        });

        // Progress forwarding is additive: "parent" mirrors upstream,
        // "self" becomes the linked handle's progress once one exists
        // (§4.4 "Progress forwarding").
        let forward = Arc::new(Mutex::new(ForwardedProgress::default()));
        {
            forward.lock().unwrap().parent = self.state.progress();
            let initial = forward.lock().unwrap().combined();
            downstream.set_progress_range(initial.min(), initial.max());
            downstream.set_progress_value(initial.value());

            let forward = forward.clone();
            let downstream_state = downstream.clone();
            self.state.on_progress(inline_context(), move |w| {
                let combined = {
                    let mut forward = forward.lock().unwrap();
                    forward.parent = w;
                    forward.combined()
                };
                downstream_state.set_progress_range(combined.min(), combined.max());
                downstream_state.set_progress_value(combined.value());
                true
            });
        }

        let cancel_once = CancelOnce::new(on_cancel);
        let downstream_for_upstream = downstream.clone();

        self.state.on_terminal(inline_context(), move |event| {
            match event {
                TerminalEvent::Succeeded(values) => {
                    let value = values
                        .last()
                        .cloned()
                        .expect("a Succeeded state always carries a result value");
                    // Evaluated on whichever thread settled upstream, then
                    // the user callback invocation proper is posted onto
                    // `ctx` (§4.4 "Callbacks MUST run in the context's
                    // execution lane").
                    if !ctx.is_alive() {
                        // §4.4 "If ctx ... becomes invalid before upstream
                        // settles, downstream is Cancelled and neither f
                        // nor g are invoked." `g` was already skipped
                        // above (only the Cancelled/Failed arm fires it).
                        downstream_for_upstream.cancel();
                        return;
                    }
                    let downstream_for_ctx = downstream_for_upstream.clone();
                    let forward = forward.clone();
                    ctx.post(Box::new(move || {
                        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| on_done(value)));
                        match outcome {
                            Ok(Outcome::Value(r)) => {
                                downstream_for_ctx.report_result(r);
                                downstream_for_ctx.report_finished();
                            }
                            Ok(Outcome::Linked(linked)) => {
                                let progress_target = downstream_for_ctx.clone();
                                linked.state.on_progress(inline_context(), move |w| {
                                    let combined = {
                                        let mut forward = forward.lock().unwrap();
                                        forward.self_ = w;
                                        forward.combined()
                                    };
                                    progress_target.set_progress_range(combined.min(), combined.max());
                                    progress_target.set_progress_value(combined.value());
                                    true
                                });
                                linked.state.on_terminal(inline_context(), move |event| {
                                    mirror_terminal(&downstream_for_ctx, event);
                                });
                            }
                            Err(payload) => {
                                // §7 "captured, attached to the downstream
                                // state, and the downstream transitions to
                                // Failed."
                                downstream_for_ctx.report_exception(panic_cause(payload));
                            }
                        }
                    }));
                }
                TerminalEvent::Cancelled | TerminalEvent::Failed(_) => {
                    // §4.4 state 3: g runs exactly once, downstream
                    // becomes Cancelled regardless of Cancelled vs Failed
                    // (§9 open question: preserved mixing). But if `ctx`
                    // already died, neither f nor g run (§4.4 "becomes
                    // invalid before upstream settles") — downstream still
                    // settles Cancelled either way.
                    if ctx.is_alive() {
                        cancel_once.fire();
                    }
                    downstream_for_upstream.cancel();
                }
            }
        });

        downstream_handle
    }

    /// `subscribe(on_done)` (§6): the single-argument form, with no cancel
    /// callback.
    pub fn then<R, F>(&self, on_done: F) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.subscribe(on_done, || {})
    }

    /// `context(ctx, on_done)` (§6): the single-argument form, with no
    /// cancel callback.
    pub fn context_then<R, F>(&self, ctx: Option<ContextRef>, on_done: F) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.context(ctx, on_done, || {})
    }

    /// Thin wrapper over `subscribe` that attaches a callback without
    /// producing a downstream handle (§4.2 "attachment helpers").
    pub fn on_completed(&self, cb: impl FnOnce(T) + Send + 'static) {
        let _: Handle<Void> = self.subscribe(
            move |v| {
                cb(v);
                Void
            },
            || {},
        );
    }

    pub fn on_cancelled(&self, cb: impl FnOnce() + Send + 'static) {
        let _: Handle<Void> = self.subscribe(move |_| Void, cb);
    }

    pub fn on_finished(&self, cb: impl Fn() + Send + Sync + 'static) {
        let cb = Arc::new(cb);
        let cb2 = cb.clone();
        let _: Handle<Void> = self.subscribe(
            move |_| {
                cb();
                Void
            },
            move || cb2(),
        );
    }

    /// Registers a progress observer. Returning `false` detaches it; a
    /// `true` return keeps it subscribed (§6 `on_progress`).
    pub fn on_progress(&self, cb: impl FnMut(crate::progress::ProgressWindow) -> bool + Send + 'static) {
        self.state.on_progress(ContextRef::main(), cb);
    }
}

impl Handle<Void> {
    /// `context(ctx, on_done, on_cancel)` for a void-typed handle, whose
    /// callback takes no argument (§6 "MAY NOT take an argument when
    /// observing a void-typed handle").
    pub fn context0<R, F, G>(&self, ctx: Option<ContextRef>, on_done: F, on_cancel: G) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.context(ctx, move |Void| on_done(), on_cancel)
    }

    pub fn subscribe0<R, F, G>(&self, on_done: F, on_cancel: G) -> Handle<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.context0(None, on_done, on_cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::status::Status;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn chain_on_value_doubles() {
        let d: Deferred<i32> = Deferred::new();
        let downstream = d.handle().subscribe(|x| x * 2, || {});
        d.complete(21);
        assert!(downstream.wait_for_finished(Some(Duration::from_secs(1))));
        assert_eq!(downstream.result().unwrap(), 42);
    }

    #[test]
    fn unwrap_nested_handle() {
        let d: Deferred<i32> = Deferred::new();
        let inner: Deferred<i32> = Deferred::new();
        inner.complete(7);
        let inner_handle = inner.handle();
        let downstream = d
            .handle()
            .subscribe_linking(move |_: i32| inner_handle, || {});
        d.complete(1);
        assert!(downstream.wait_for_finished(Some(Duration::from_secs(1))));
        assert_eq!(downstream.result().unwrap(), 7);
    }

    #[test]
    fn exception_capture_fails_downstream() {
        let d: Deferred<i32> = Deferred::new();
        let downstream = d.handle().subscribe(
            |_| -> i32 {
                panic!("boom");
            },
            || {},
        );
        d.complete(1);
        assert!(downstream.wait_for_finished(Some(Duration::from_secs(1))));
        assert_eq!(downstream.status(), Status::Failed);
    }

    #[test]
    fn upstream_cancel_invokes_g_once_and_cancels_downstream() {
        let d: Deferred<i32> = Deferred::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let downstream = d.handle().subscribe(|x| x, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        d.cancel();
        assert!(downstream.wait_for_finished(Some(Duration::from_secs(1))));
        assert_eq!(downstream.status(), Status::Cancelled);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn downstream_cancel_pushes_upstream() {
        let d: Deferred<i32> = Deferred::new();
        let upstream_handle = d.handle();
        let downstream = upstream_handle.subscribe(|x| x, || {});
        downstream.request_cancel();
        assert!(upstream_handle.wait_for_finished(Some(Duration::from_secs(1))));
        assert_eq!(upstream_handle.status(), Status::Cancelled);
    }

    #[test]
    fn dead_ctx_skips_g_when_upstream_cancels() {
        use crate::context::Context;

        struct Inline;
        impl Context for Inline {
            fn post(&self, job: Box<dyn FnOnce() + Send>) {
                job();
            }
        }

        let ctx: Arc<dyn Context> = Arc::new(Inline);
        let weak_ctx = ContextRef::from_weak(&ctx);
        drop(ctx);

        let d: Deferred<i32> = Deferred::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let downstream = d.handle().context(Some(weak_ctx), |x| x, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        d.cancel();
        assert!(downstream.wait_for_finished(Some(Duration::from_secs(1))));
        assert_eq!(downstream.status(), Status::Cancelled);
        assert!(
            !fired.load(Ordering::SeqCst),
            "g must not run once ctx died before upstream settled"
        );
    }
}
