//! Coalesces repeated restart requests while a running producer is still
//! cancelling down to exactly one replacement (§4.7).

use std::sync::{Arc, Mutex};

use crate::context::{inline_context, main_context};
use crate::handle::Handle;

type Producer<T> = Box<dyn FnOnce() -> Handle<T> + Send>;

struct State<T: Send + 'static> {
    current: Option<Handle<T>>,
    pending: Option<Producer<T>>,
}

struct Inner<T: Send + 'static> {
    state: Mutex<State<T>>,
    on_changed: Mutex<Option<Box<dyn Fn(Handle<T>) + Send + Sync>>>,
}

/// Restarts a producer-of-handles, cancelling whatever is currently running
/// and adopting the latest request once it settles, rather than running
/// every requested producer in turn (§4.7 "restart coalescing").
pub struct Restarter<T: Send + 'static>(Arc<Inner<T>>);

impl<T: Send + 'static> Clone for Restarter<T> {
    fn clone(&self) -> Self {
        Restarter(self.0.clone())
    }
}

impl<T: Clone + Send + 'static> Restarter<T> {
    pub fn new() -> Self {
        Restarter(Arc::new(Inner {
            state: Mutex::new(State {
                current: None,
                pending: None,
            }),
            on_changed: Mutex::new(None),
        }))
    }

    /// Registers a callback invoked each time a producer is adopted as
    /// current (§4.7 "on_changed").
    pub fn on_changed(&self, cb: impl Fn(Handle<T>) + Send + Sync + 'static) {
        *self.0.on_changed.lock().unwrap() = Some(Box::new(cb));
    }

    /// Requests a restart with `producer`. If nothing is currently running,
    /// it is adopted immediately. Otherwise it replaces any previously
    /// queued producer, and the currently-running one is asked to cancel;
    /// only the most recently requested producer survives to be adopted
    /// (§4.7 "coalescing").
    ///
    /// The cancel request to the current producer is posted onto
    /// [`main_context`] rather than issued inline: a real producer's cancel
    /// takes wall-clock time to actually settle, and posting preserves that
    /// gap so a burst of `restart` calls on the caller's thread can replace
    /// `pending` before the first cancel lands, instead of the settle
    /// re-entering this call and adopting a producer that was about to be
    /// superseded.
    pub fn restart(&self, producer: impl FnOnce() -> Handle<T> + Send + 'static) {
        let producer: Producer<T> = Box::new(producer);
        enum Action<T: Send + 'static> {
            Adopt(Producer<T>),
            CancelCurrent(Handle<T>),
        }
        let action = {
            let mut state = self.0.state.lock().unwrap();
            match &state.current {
                Some(current) => {
                    let current = current.clone();
                    state.pending = Some(producer);
                    Action::CancelCurrent(current)
                }
                None => Action::Adopt(producer),
            }
        };
        match action {
            Action::Adopt(producer) => self.adopt(producer),
            Action::CancelCurrent(current) => {
                main_context().post(Box::new(move || current.request_cancel()));
            }
        }
    }

    fn adopt(&self, producer: Producer<T>) {
        let handle = producer();
        self.0.state.lock().unwrap().current = Some(handle.clone());
        if let Some(cb) = self.0.on_changed.lock().unwrap().as_ref() {
            cb(handle.clone());
        }
        let this = self.clone();
        handle
            .state
            .on_terminal(inline_context(), move |_event| this.on_current_settled());
    }

    fn on_current_settled(&self) {
        let next = {
            let mut state = self.0.state.lock().unwrap();
            state.current = None;
            state.pending.take()
        };
        if let Some(producer) = next {
            self.adopt(producer);
        }
    }

    /// The currently-adopted handle, if a producer is running.
    pub fn current(&self) -> Option<Handle<T>> {
        self.0.state.lock().unwrap().current.clone()
    }
}

impl<T: Clone + Send + 'static> Default for Restarter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::status::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn restart_with_nothing_running_adopts_immediately() {
        let r: Restarter<i32> = Restarter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        r.on_changed(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        r.restart(|| {
            let d: Deferred<i32> = Deferred::new();
            d.complete(1);
            d.handle()
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn coalesces_to_latest_producer_while_cancelling() {
        let r: Restarter<i32> = Restarter::new();
        let (tx, rx) = std::sync::mpsc::channel::<Handle<i32>>();
        r.on_changed(move |h| {
            tx.send(h).unwrap();
        });

        // Adopted immediately: nothing was running.
        let p1: Deferred<i32> = Deferred::new();
        let p1_handle = p1.handle();
        r.restart(move || p1_handle);
        let first = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("p1 should be adopted");
        assert!(!first.is_finished());

        // p1 is still running; both of these queue behind its cancel, which
        // is only posted (not run inline), so p2 never gets a chance to run
        // before p3 overwrites it as `pending`.
        let p2_invoked = Arc::new(AtomicUsize::new(0));
        let p2_invoked2 = p2_invoked.clone();
        r.restart(move || {
            p2_invoked2.fetch_add(1, Ordering::SeqCst);
            let d: Deferred<i32> = Deferred::new();
            d.complete(2);
            d.handle()
        });
        r.restart(|| {
            let d: Deferred<i32> = Deferred::new();
            d.complete(3);
            d.handle()
        });

        let second = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("the coalesced replacement should be adopted");
        assert_eq!(second.result().unwrap(), 3);
        assert_eq!(p2_invoked.load(Ordering::SeqCst), 0);
        assert!(
            rx.try_recv().is_err(),
            "on_changed must fire exactly twice: p1, then the coalesced p3"
        );
    }

    #[test]
    fn natural_completion_without_pending_leaves_restarter_idle() {
        let r: Restarter<i32> = Restarter::new();
        let d: Deferred<i32> = Deferred::new();
        let h = d.handle();
        r.restart(move || h);
        d.complete(1);
        assert_eq!(
            r.current().map(|h| h.status()),
            Some(Status::Succeeded)
        );
    }
}
