//! The producer-side write capability on a shared state (§4.3).

use std::any::TypeId;
use std::sync::Mutex;

use crate::context::inline_context;
use crate::engine::mirror_terminal;
use crate::error::ApiMisuseError;
use crate::handle::Handle;
use crate::shared_state::{SharedState, TerminalEvent};
use crate::value::Void;

/// The write capability on a shared state; the counterpart to a [`Handle`].
/// At most one logical producer is expected, but concurrent writers are
/// serialized by the underlying state (§3).
pub struct Deferred<T: Send + 'static> {
    state: SharedState<T>,
    // Set by `complete_with_handle`/`complete_with_nested_handle`: redirects
    // `cancel()` to the linked upstream instead of settling this state
    // directly (§4.3 "cancellation push-down").
    upstream_cancel: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Deferred {
            state: SharedState::new(),
            upstream_cancel: Mutex::new(None),
        }
    }

    /// A `Handle` viewing this deferred's state.
    pub fn handle(&self) -> Handle<T> {
        Handle::from_state(self.state.clone())
    }

    pub(crate) fn state(&self) -> &SharedState<T> {
        &self.state
    }

    /// Pending -> Running.
    pub fn report_started(&self) {
        self.state.report_started();
    }

    pub fn set_progress_value(&self, value: i64) {
        self.state.set_progress_value(value);
    }

    pub fn set_progress_range(&self, min: i64, max: i64) {
        self.state.set_progress_range(min, max);
    }

    /// `complete(value)` (§4.3).
    pub fn complete(&self, value: T) {
        self.state.report_result(value);
        self.state.report_finished();
    }

    /// `complete(list)` (§4.3).
    pub fn complete_list(&self, values: Vec<T>) {
        self.state.report_results(values);
        self.state.report_finished();
    }

    /// `complete(handle)` (§4.3): this deferred's terminal status mirrors
    /// `upstream`'s, and its progress is forwarded while linked.
    pub fn complete_with_handle(&self, upstream: Handle<T>)
    where
        T: Clone,
    {
        self.link(upstream);
    }

    fn link(&self, upstream: Handle<T>)
    where
        T: Clone,
    {
        *self.upstream_cancel.lock().unwrap() = Some({
            let upstream = upstream.clone();
            Box::new(move || upstream.request_cancel())
        });

        let initial = upstream.progress();
        self.state.set_progress_range(initial.min(), initial.max());
        self.state.set_progress_value(initial.value());

        let progress_target = self.state.clone();
        upstream.state.on_progress(inline_context(), move |w| {
            progress_target.set_progress_range(w.min(), w.max());
            progress_target.set_progress_value(w.value());
            true
        });

        let downstream = self.state.clone();
        upstream
            .state
            .on_terminal(inline_context(), move |event| {
                mirror_terminal(&downstream, event);
            });
    }

    /// `complete(handle_of_handle)` (§4.3): await the outer handle, then
    /// the inner one it resolves to. Only one level is unwrapped.
    ///
    /// Rejected at construction time for `T = Void`: a void result carries
    /// no value to unwrap a nested handle into, so §4.3 treats this as API
    /// misuse rather than a silently-degenerate link.
    pub fn complete_with_nested_handle(
        &self,
        outer: Handle<Handle<T>>,
    ) -> Result<(), ApiMisuseError>
    where
        T: Clone,
    {
        if TypeId::of::<T>() == TypeId::of::<Void>() {
            return Err(ApiMisuseError(
                "cannot complete a void Deferred with a handle-of-handle",
            ));
        }

        *self.upstream_cancel.lock().unwrap() = Some({
            let outer = outer.clone();
            Box::new(move || outer.request_cancel())
        });

        let downstream = self.state.clone();
        outer
            .state
            .on_terminal(inline_context(), move |event| match event {
                TerminalEvent::Succeeded(values) => match values.last() {
                    Some(inner) => {
                        let inner = inner.clone();
                        let downstream = downstream.clone();
                        inner
                            .state
                            .on_terminal(inline_context(), move |inner_event| {
                                mirror_terminal(&downstream, inner_event);
                            });
                    }
                    None => downstream.cancel(),
                },
                TerminalEvent::Cancelled => {
                    downstream.cancel();
                }
                TerminalEvent::Failed(err) => {
                    downstream.report_exception(
                        err.cause().cloned().unwrap_or_else(|| {
                            std::sync::Arc::new(std::io::Error::other(err.to_string()))
                        }),
                    );
                }
            });

        Ok(())
    }

    /// `cancel()` (§4.3): cancels this deferred directly, or pushes the
    /// cancel request upstream if linked via `complete(handle)`.
    pub fn cancel(&self) {
        match self.upstream_cancel.lock().unwrap().take() {
            Some(request) => request(),
            None => self.state.cancel(),
        }
    }

    /// `cancel(handle)` (§4.3): cancel this deferred once `trigger`
    /// settles, regardless of how it settles.
    pub fn cancel_when<U: Send + 'static>(&self, trigger: Handle<U>) {
        let downstream = self.state.clone();
        trigger
            .state
            .on_terminal(inline_context(), move |_event| {
                downstream.cancel();
            });
    }

    /// `track(handle)` (§4.3): adopts `source`'s progress window
    /// additively into this deferred's own progress, without linking
    /// completion.
    pub fn track<U: Send + 'static>(&self, source: &Handle<U>) {
        let target = self.state.clone();
        let base = self.state.progress();
        source.state.on_progress(inline_context(), move |w| {
            target.set_progress_range(base.min(), base.max() + w.max());
            target.set_progress_value(base.value() + w.value());
            true
        });
    }
}

impl<T: Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Deferred<T> {
    /// §3 "A Deferred dropped without completion MUST transition its state
    /// to Cancelled."
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.state.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn complete_settles_succeeded() {
        let d: Deferred<i32> = Deferred::new();
        let h = d.handle();
        d.complete(7);
        assert_eq!(h.status(), Status::Succeeded);
        assert_eq!(h.result().unwrap(), 7);
    }

    #[test]
    fn dropped_without_completion_cancels() {
        crate::init_test_logging();
        let h = {
            let d: Deferred<i32> = Deferred::new();
            d.handle()
        };
        assert_eq!(h.status(), Status::Cancelled);
    }

    #[test]
    fn linked_deferred_mirrors_upstream() {
        let upstream: Deferred<i32> = Deferred::new();
        let downstream: Deferred<i32> = Deferred::new();
        downstream.complete_with_handle(upstream.handle());
        let downstream_handle = downstream.handle();
        upstream.complete(9);
        assert_eq!(downstream_handle.status(), Status::Succeeded);
        assert_eq!(downstream_handle.result().unwrap(), 9);
    }

    #[test]
    fn cancel_on_linked_deferred_pushes_upstream() {
        let upstream: Deferred<i32> = Deferred::new();
        let upstream_handle = upstream.handle();
        let downstream: Deferred<i32> = Deferred::new();
        downstream.complete_with_handle(upstream.handle());
        downstream.cancel();
        assert_eq!(upstream_handle.status(), Status::Cancelled);
    }

    #[test]
    fn nested_handle_unwraps_one_level() {
        let inner: Deferred<i32> = Deferred::new();
        inner.complete(3);
        let outer: Deferred<Handle<i32>> = Deferred::new();
        outer.complete(inner.handle());

        let downstream: Deferred<i32> = Deferred::new();
        downstream
            .complete_with_nested_handle(outer.handle())
            .expect("non-void T must be accepted");
        assert_eq!(downstream.handle().result().unwrap(), 3);
    }

    #[test]
    fn nested_handle_on_void_deferred_is_rejected() {
        use crate::error::{Error, ErrorKind};

        let inner: Deferred<Void> = Deferred::new();
        let outer: Deferred<Handle<Void>> = Deferred::new();
        let downstream: Deferred<Void> = Deferred::new();

        let err = downstream
            .complete_with_nested_handle(outer.handle())
            .expect_err("a void Deferred must reject a handle-of-handle");
        assert_eq!(Error::from(err).kind(), ErrorKind::ApiMisuse);

        // Nothing was wired up: the downstream is untouched, and both
        // `inner`/`outer` dropping without completion just cancels them.
        drop(inner);
        drop(outer);
        assert_eq!(downstream.handle().status(), Status::Pending);
    }
}
