//! Aggregates N upstream handles into one under a completion policy (§4.5).

use std::ops::Shl;
use std::sync::{Arc, Mutex};

use crate::context::inline_context;
use crate::deferred::Deferred;
use crate::handle::Handle;
use crate::progress::{self, ProgressWindow};
use crate::shared_state::TerminalEvent;

/// Aggregate completion policy (§4.5, §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// First child `Cancelled`/`Failed` cancels the aggregate and every
    /// still-running sibling.
    FailFast,
    /// Wait for every child to settle; `Succeeded` iff all children did.
    AllSettled,
}

struct AggregateState {
    total: usize,
    settled: usize,
    any_cancelled: bool,
}

struct Inner<T: Send + 'static> {
    mode: Mode,
    deferred: Deferred<T>,
    children: Mutex<Vec<Handle<T>>>,
    agg: Mutex<AggregateState>,
}

/// Builds an aggregate handle from zero or more child handles (§4.5).
/// Cloning a `Combinator` shares the same aggregate; `combinator << handle`
/// adds a child (§6).
pub struct Combinator<T: Send + 'static>(Arc<Inner<T>>);

impl<T: Send + 'static> Clone for Combinator<T> {
    fn clone(&self) -> Self {
        Combinator(self.0.clone())
    }
}

impl<T: Clone + Send + 'static> Combinator<T> {
    pub fn new(mode: Mode) -> Self {
        Combinator(Arc::new(Inner {
            mode,
            deferred: Deferred::new(),
            children: Mutex::new(Vec::new()),
            agg: Mutex::new(AggregateState {
                total: 0,
                settled: 0,
                any_cancelled: false,
            }),
        }))
    }

    /// Adds a child handle, tracked in insertion order (§4.5 "Tie-breaks").
    pub fn push(&self, child: Handle<T>) -> &Self {
        self.0.children.lock().unwrap().push(child.clone());
        self.0.agg.lock().unwrap().total += 1;
        self.wire_child(child);
        self
    }

    fn wire_child(&self, child: Handle<T>) {
        let this = self.clone();
        child.state.on_progress(inline_context(), move |_w| {
            this.recompute_progress();
            true
        });

        let this = self.clone();
        child
            .state
            .on_terminal(inline_context(), move |event| this.on_child_settled(event));
    }

    fn recompute_progress(&self) {
        // A settled child's progress is forced to its own max before
        // summing, so a child that never reported full progress doesn't
        // leave the aggregate permanently short (§3 "clamp on settle").
        let windows: Vec<ProgressWindow> = self
            .0
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|h| {
                let mut w = h.progress();
                if h.is_finished() {
                    w.finish();
                }
                w
            })
            .collect();
        let agg = progress::aggregate(&windows);
        self.0.deferred.set_progress_range(agg.min(), agg.max());
        self.0.deferred.set_progress_value(agg.value());
    }

    fn on_child_settled(&self, event: TerminalEvent<T>) {
        self.recompute_progress();
        if let TerminalEvent::Succeeded(values) = &event {
            if let Some(v) = values.last() {
                self.0.deferred.state().report_result(v.clone());
            }
        }
        let cancel_like = matches!(event, TerminalEvent::Cancelled | TerminalEvent::Failed(_));

        let (fail_fast_trigger, all_settled) = {
            let mut agg = self.0.agg.lock().unwrap();
            agg.settled += 1;
            if cancel_like {
                agg.any_cancelled = true;
            }
            let fail_fast_trigger = self.0.mode == Mode::FailFast
                && cancel_like
                && !self.0.deferred.state().is_terminal();
            (fail_fast_trigger, agg.settled >= agg.total)
        };

        if fail_fast_trigger {
            self.cancel_all_children();
            self.0.deferred.state().cancel();
        } else if all_settled && !self.0.deferred.state().is_terminal() {
            if self.0.agg.lock().unwrap().any_cancelled {
                self.0.deferred.state().cancel();
            } else {
                self.0.deferred.state().report_finished();
            }
        }
    }

    fn cancel_all_children(&self) {
        for child in self.0.children.lock().unwrap().iter() {
            child.request_cancel();
        }
    }

    /// The aggregate handle. An empty aggregate terminalizes `Succeeded`
    /// immediately when first observed (§4.5 "Empty aggregate").
    pub fn handle(&self) -> Handle<T> {
        let is_empty = self.0.agg.lock().unwrap().total == 0;
        if is_empty && !self.0.deferred.state().is_terminal() {
            self.0.deferred.state().report_finished();
        }
        self.0.deferred.handle()
    }

    /// Cancelling the aggregate cancels every still-running child, in both
    /// modes (§4.5 "Aggregate cancel").
    pub fn cancel(&self) {
        self.cancel_all_children();
        self.0.deferred.cancel();
    }
}

impl<T: Clone + Send + 'static> Shl<Handle<T>> for Combinator<T> {
    type Output = Combinator<T>;

    fn shl(self, child: Handle<T>) -> Combinator<T> {
        self.push(child);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn empty_aggregate_succeeds_on_observe() {
        let c: Combinator<i32> = Combinator::new(Mode::AllSettled);
        assert_eq!(c.handle().status(), Status::Succeeded);
    }

    #[test]
    fn fail_fast_cancels_siblings() {
        let da: Deferred<()> = Deferred::new();
        let db: Deferred<()> = Deferred::new();
        let db_handle = db.handle();
        let c = Combinator::new(Mode::FailFast);
        c.push(da.handle());
        c.push(db_handle.clone());
        let agg = c.handle();
        da.cancel();
        assert_eq!(agg.status(), Status::Cancelled);
        assert_eq!(db_handle.status(), Status::Cancelled);
    }

    #[test]
    fn all_settled_does_not_force_cancel_siblings() {
        let da: Deferred<()> = Deferred::new();
        let db: Deferred<()> = Deferred::new();
        let db_handle = db.handle();
        let c = Combinator::new(Mode::AllSettled);
        c.push(da.handle());
        c.push(db_handle.clone());
        let agg = c.handle();
        da.cancel();
        db.complete(());
        assert_eq!(agg.status(), Status::Cancelled);
        assert_eq!(db_handle.status(), Status::Succeeded);
    }

    #[test]
    fn all_settled_succeeds_when_all_succeed() {
        let da: Deferred<i32> = Deferred::new();
        let db: Deferred<i32> = Deferred::new();
        let c = Combinator::new(Mode::AllSettled);
        c.push(da.handle());
        c.push(db.handle());
        let agg = c.handle();
        da.complete(1);
        db.complete(2);
        assert_eq!(agg.status(), Status::Succeeded);
    }

    #[test]
    fn progress_sums_children() {
        let da: Deferred<()> = Deferred::new();
        let db: Deferred<()> = Deferred::new();
        let c = Combinator::new(Mode::AllSettled);
        c.push(da.handle());
        c.push(db.handle());
        let agg = c.handle();
        da.set_progress_range(0, 10);
        da.set_progress_value(5);
        db.set_progress_range(0, 20);
        db.set_progress_value(10);
        assert_eq!(agg.progress().max(), 30);
        assert_eq!(agg.progress().value(), 15);
    }

    #[test]
    fn settled_child_progress_is_finished_before_summing() {
        let da: Deferred<i32> = Deferred::new();
        let db: Deferred<i32> = Deferred::new();
        let c = Combinator::new(Mode::AllSettled);
        c.push(da.handle());
        c.push(db.handle());
        let agg = c.handle();
        da.set_progress_range(0, 10);
        da.set_progress_value(3); // never reaches 10 before completing
        da.complete(1);
        db.set_progress_range(0, 10);
        db.set_progress_value(10);
        assert_eq!(agg.progress().value(), 20, "settled child counts as its own max");
    }
}
