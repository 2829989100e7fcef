//! The shared state behind a future (§3, §4.1): the reference-counted
//! record holding status, results, exception, progress, and observers.
//! Transitions are monotonic and this is the only mutable object shared
//! across threads (§5) — every mutation is serialized under a per-state
//! mutex, and observer callbacks are always invoked after the lock is
//! released (snapshot-then-fire, §9).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use atomic_waker::AtomicWaker;
use slab::Slab;

use crate::context::ContextRef;
use crate::error::{Cause, Error};
use crate::progress::ProgressWindow;
use crate::status::{AtomicStatus, Status};
use crate::value::ValueCell;

/// The result or cancellation reason of a settled shared state, handed to a
/// terminal observer (§4.1 "observer firing").
pub(crate) enum TerminalEvent<T> {
    Succeeded(Arc<[T]>),
    Cancelled,
    Failed(Error),
}

impl<T> Clone for TerminalEvent<T> {
    fn clone(&self) -> Self {
        match self {
            TerminalEvent::Succeeded(v) => TerminalEvent::Succeeded(v.clone()),
            TerminalEvent::Cancelled => TerminalEvent::Cancelled,
            TerminalEvent::Failed(e) => TerminalEvent::Failed(e.clone()),
        }
    }
}

struct TerminalObserver<T> {
    context: ContextRef,
    callback: Box<dyn FnOnce(TerminalEvent<T>) + Send>,
}

struct ProgressObserver {
    context: ContextRef,
    // Returns false to request detachment (§6 `on_progress`).
    callback: Box<dyn FnMut(ProgressWindow) -> bool + Send>,
}

struct Data<T> {
    results: ValueCell<T>,
    settled_results: Option<Arc<[T]>>,
    exception: Option<Error>,
    progress: ProgressWindow,
    terminal_observers: Vec<TerminalObserver<T>>,
    terminal_event: Option<TerminalEvent<T>>,
    progress_observers: Slab<ProgressObserver>,
}

impl<T> Default for Data<T> {
    fn default() -> Self {
        Self {
            results: ValueCell::default(),
            settled_results: None,
            exception: None,
            progress: ProgressWindow::default(),
            terminal_observers: Vec::new(),
            terminal_event: None,
            progress_observers: Slab::new(),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner<T> {
    id: u64,
    status: AtomicStatus,
    data: Mutex<Data<T>>,
    condvar: Condvar,
    // Backs the `Future` impl on `Handle` (§6 "awaitable form"), the same
    // way the teacher's transfer futures wake a poller on completion
    // instead of pulling in a scheduler crate.
    waker: AtomicWaker,
}

/// The reference-counted state behind a [`Handle`][crate::Handle] and a
/// [`Deferred`][crate::Deferred] (§3). Cloning is cheap: it shares the same
/// underlying record.
pub(crate) struct SharedState<T>(Arc<Inner<T>>);

impl<T> Clone for SharedState<T> {
    fn clone(&self) -> Self {
        SharedState(self.0.clone())
    }
}

impl<T> fmt::Debug for SharedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("id", &self.0.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + 'static> SharedState<T> {
    pub(crate) fn new() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("shared_state[{id}]: created, Pending");
        SharedState(Arc::new(Inner {
            id,
            status: AtomicStatus::new(Status::Pending),
            data: Mutex::new(Data::default()),
            condvar: Condvar::new(),
            waker: AtomicWaker::new(),
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn status(&self) -> Status {
        self.0.status.load()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// §4.1 `report_started`: Pending→Running, no-op otherwise.
    pub(crate) fn report_started(&self) {
        if self.0.status.move_pending_to_running() {
            log::trace!("shared_state[{}]: Pending -> Running", self.0.id);
        }
    }

    pub(crate) fn report_result(&self, value: T) {
        let mut data = self.0.data.lock().unwrap();
        if !self.status().is_terminal() {
            data.results.push(value);
        }
    }

    pub(crate) fn report_results(&self, values: Vec<T>) {
        let mut data = self.0.data.lock().unwrap();
        if !self.status().is_terminal() {
            data.results.extend(values);
        }
    }

    /// §4.1 `report_finished`: Succeeded, fires observers exactly once.
    pub(crate) fn report_finished(&self) -> bool {
        self.settle(|data| {
            let results: Arc<[T]> = Arc::from(std::mem::take(&mut data.results).into_vec());
            data.settled_results = Some(results.clone());
            (Status::Succeeded, TerminalEvent::Succeeded(results))
        })
    }

    /// §4.1 `cancel`: Cancelled, fires observers exactly once.
    pub(crate) fn cancel(&self) -> bool {
        self.settle(|_| (Status::Cancelled, TerminalEvent::Cancelled))
    }

    /// §4.1 `report_exception`: Failed, treated as "Cancelled with cause"
    /// by downstream cancel observers (§7).
    pub(crate) fn report_exception(&self, cause: Cause) -> bool {
        self.settle(move |data| {
            let err = Error::failed(cause).log_error();
            data.exception = Some(err.clone());
            (Status::Failed, TerminalEvent::Failed(err))
        })
    }

    /// Shared terminal-transition machinery: only the first caller across
    /// all of `report_finished`/`cancel`/`report_exception` wins (§4.1
    /// "idempotent after the first terminal write").
    fn settle(&self, f: impl FnOnce(&mut Data<T>) -> (Status, TerminalEvent<T>)) -> bool {
        let (event, observers) = {
            let mut data = self.0.data.lock().unwrap();
            if self.status().is_terminal() {
                return false;
            }
            let (status, event) = f(&mut data);
            self.0.status.store(status);
            data.terminal_event = Some(event.clone());
            log::debug!("shared_state[{}]: settled {:?}", self.0.id, status);
            self.0.condvar.notify_all();
            (event, std::mem::take(&mut data.terminal_observers))
        };
        // Snapshot-then-fire: the lock is released before any callback runs.
        for obs in observers {
            Self::dispatch_terminal(obs, event.clone());
        }
        self.0.waker.wake();
        true
    }

    fn dispatch_terminal(obs: TerminalObserver<T>, event: TerminalEvent<T>) {
        let TerminalObserver { context, callback } = obs;
        context.post(Box::new(move || callback(event)));
    }

    /// Registers a terminal observer. If the state is already settled, the
    /// observer is scheduled onto its context immediately rather than
    /// appended to the list (§4.1 "late-attachment replay").
    pub(crate) fn on_terminal(
        &self,
        context: ContextRef,
        callback: impl FnOnce(TerminalEvent<T>) + Send + 'static,
    ) {
        let existing = {
            let mut data = self.0.data.lock().unwrap();
            if let Some(event) = &data.terminal_event {
                Some(event.clone())
            } else {
                data.terminal_observers.push(TerminalObserver {
                    context: context.clone(),
                    callback: Box::new(callback),
                });
                None
            }
        };
        if let Some(event) = existing {
            context.post(Box::new(move || callback(event)));
        }
    }

    pub(crate) fn set_progress_range(&self, min: i64, max: i64) {
        let observers = {
            let mut data = self.0.data.lock().unwrap();
            data.progress.set_range(min, max);
            self.snapshot_progress_observers(&mut data)
        };
        self.dispatch_progress(observers);
    }

    pub(crate) fn set_progress_value(&self, value: i64) {
        let observers = {
            let mut data = self.0.data.lock().unwrap();
            data.progress.set_value(value);
            self.snapshot_progress_observers(&mut data)
        };
        self.dispatch_progress(observers);
    }

    fn snapshot_progress_observers(
        &self,
        data: &mut Data<T>,
    ) -> Vec<(ContextRef, ProgressWindow)> {
        data.progress_observers
            .iter()
            .map(|(_, o)| (o.context.clone(), data.progress))
            .collect()
    }

    fn dispatch_progress(&self, observers: Vec<(ContextRef, ProgressWindow)>) {
        if observers.is_empty() {
            return;
        }
        let state = self.clone();
        for (context, window) in observers {
            let state = state.clone();
            context.post(Box::new(move || state.fire_one_progress(window)));
        }
    }

    /// Invoked on the observer's context; re-checks the slab (an observer
    /// may have detached between posting and running) and fires the single
    /// matching entry, removing it if it returns `false`.
    fn fire_one_progress(&self, window: ProgressWindow) {
        let mut data = self.0.data.lock().unwrap();
        let mut to_remove = Vec::new();
        for (key, obs) in data.progress_observers.iter_mut() {
            if !(obs.callback)(window) {
                to_remove.push(key);
            }
        }
        for key in to_remove {
            data.progress_observers.remove(key);
        }
    }

    /// Registers a progress observer; returns its slab key (unused by
    /// callers today but kept for future explicit detach support).
    pub(crate) fn on_progress(
        &self,
        context: ContextRef,
        callback: impl FnMut(ProgressWindow) -> bool + Send + 'static,
    ) -> usize {
        let mut data = self.0.data.lock().unwrap();
        data.progress_observers.insert(ProgressObserver {
            context,
            callback: Box::new(callback),
        })
    }

    pub(crate) fn progress(&self) -> ProgressWindow {
        self.0.data.lock().unwrap().progress
    }

    pub(crate) fn results(&self) -> Option<Arc<[T]>> {
        self.0.data.lock().unwrap().settled_results.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.0.data.lock().unwrap().exception.clone()
    }

    /// Polls for terminal status, registering `cx`'s waker if not yet
    /// settled (§6 "awaitable form"). Registration happens before the
    /// re-check to avoid missing a settle that races with this poll.
    pub(crate) fn poll_terminal(&self, cx: &mut TaskContext<'_>) -> Poll<()> {
        if self.is_terminal() {
            return Poll::Ready(());
        }
        self.0.waker.register(cx.waker());
        if self.is_terminal() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// §4.2 `wait_for_finished`: blocks the current thread until terminal
    /// or `timeout` elapses. Returns whether terminal was reached.
    pub(crate) fn wait_for_finished(&self, timeout: Option<Duration>) -> bool {
        if self.is_terminal() {
            return true;
        }
        let mut data = self.0.data.lock().unwrap();
        match timeout {
            None => {
                while !self.status().is_terminal() {
                    data = self.0.condvar.wait(data).unwrap();
                }
                true
            }
            Some(timeout) => {
                let mut remaining = timeout;
                let start = std::time::Instant::now();
                while !self.status().is_terminal() {
                    let (guard, result) =
                        self.0.condvar.wait_timeout(data, remaining).unwrap();
                    data = guard;
                    if result.timed_out() {
                        return self.status().is_terminal();
                    }
                    remaining = timeout.saturating_sub(start.elapsed());
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InlineContext;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    fn inline_ctx() -> ContextRef {
        ContextRef::Main(Arc::new(InlineContext))
    }

    #[test]
    fn report_finished_is_idempotent() {
        crate::init_test_logging();
        let s: SharedState<i32> = SharedState::new();
        s.report_result(1);
        assert!(s.report_finished());
        assert!(!s.report_finished());
        assert_eq!(s.status(), Status::Succeeded);
        assert_eq!(s.results().unwrap().as_ref(), &[1]);
    }

    #[test]
    fn cancel_then_finish_is_rejected() {
        let s: SharedState<i32> = SharedState::new();
        assert!(s.cancel());
        assert!(!s.report_finished());
        assert_eq!(s.status(), Status::Cancelled);
    }

    #[test]
    fn wait_for_finished_blocks_until_settled() {
        let s: SharedState<i32> = SharedState::new();
        let s2 = s.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            s2.report_finished();
        });
        assert!(s.wait_for_finished(None));
    }

    #[test]
    fn on_terminal_fires_exactly_once_on_settle() {
        let s: SharedState<i32> = SharedState::new();
        let (tx, rx) = mpsc::channel();
        s.on_terminal(inline_ctx(), move |event| {
            tx.send(matches!(event, TerminalEvent::Succeeded(_))).unwrap();
        });
        s.report_result(42);
        s.report_finished();
        assert_eq!(rx.recv().unwrap(), true);
        assert!(rx.try_recv().is_err(), "observer must fire exactly once");
    }

    #[test]
    fn on_terminal_attached_after_settle_replays_immediately() {
        let s: SharedState<i32> = SharedState::new();
        s.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        s.on_terminal(inline_ctx(), move |event| {
            assert!(matches!(event, TerminalEvent::Cancelled));
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_reports_cause() {
        let s: SharedState<i32> = SharedState::new();
        let cause: Cause = Arc::new(std::io::Error::other("boom"));
        assert!(s.report_exception(cause));
        assert_eq!(s.status(), Status::Failed);
        assert!(s.error().unwrap().cause().is_some());
    }

    #[test]
    fn progress_observer_sees_updates_and_can_detach() {
        let s: SharedState<i32> = SharedState::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        s.on_progress(inline_ctx(), move |w| {
            seen2.lock().unwrap().push(w.value());
            w.value() < 5
        });
        s.set_progress_range(0, 10);
        s.set_progress_value(3); // 3 < 5: observer stays subscribed
        s.set_progress_value(7); // 7 >= 5: observer returns false, detaches
        s.set_progress_value(9); // must not be observed
        let values = seen.lock().unwrap().clone();
        assert_eq!(values, vec![3, 7]);
    }
}
