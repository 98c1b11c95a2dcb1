use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

use syncpoint_types::{ErrorKind, Failure, NodeState};

use crate::cancel::{CancelScope, cancel_set};
use crate::frame::{self, misuse};
use crate::handle::{Deferred, SharedDeferred, Step};
use crate::node::{CatchFn, Children, DupFn, FinalFn, FinishFn, Payload, Reaction, StepOut, ThenFn};
use crate::source::{ImmediateSource, Source, TimerSource};

/// A deferred that fulfils with `value` once it becomes reachable from the
/// barrier root. Never evaluated if nothing consumes it.
pub fn constant<T: 'static>(value: T) -> Deferred<T> {
    adopt_source(ImmediateSource {
        outcome: Some(Ok(Rc::new(value))),
    })
}

/// The rejecting mirror of [`constant`].
pub fn failed<T: 'static>(failure: Failure) -> Deferred<T> {
    adopt_source(ImmediateSource {
        outcome: Some(Err(failure)),
    })
}

/// A deferred that fulfils with `()` once `after` has elapsed, measured from
/// the moment the node is started.
pub fn delay(after: Duration) -> Deferred<()> {
    adopt_source(TimerSource { after, token: None })
}

/// Wraps a custom source adapter in a deferred. The adapter must settle with
/// a payload of type `T`.
pub fn from_source<T: 'static>(source: impl Source + 'static) -> Deferred<T> {
    adopt_source(source)
}

fn adopt_source<T: 'static>(source: impl Source + 'static) -> Deferred<T> {
    frame::with_frame(|frame| {
        let node = frame.insert(Reaction::Source(Some(Box::new(source))));
        Deferred::from_parts(frame.barrier, node)
    })
}

/// Moves a settled payload out of the engine's erasure. Exclusive handoff
/// guarantees unique ownership at this point.
pub(crate) fn take_payload<T: 'static>(payload: Payload) -> T {
    let typed = payload
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("deferred settled with an unexpected payload type"));
    Rc::try_unwrap(typed).unwrap_or_else(|_| panic!("deferred payload is still aliased"))
}

fn erase<U: 'static>(step: Step<U>) -> StepOut {
    match step {
        Step::Now(value) => StepOut::Now(Rc::new(value)),
        Step::Wait(deferred) => StepOut::Wait {
            barrier: deferred.barrier(),
            node: deferred.node(),
        },
        Step::Fail(failure) => StepOut::Fail(failure),
    }
}

/// Runs a user callback, translating panics into `user`-kind rejections at
/// the combinator boundary.
fn run_user<U: 'static>(f: impl FnOnce() -> Step<U>) -> StepOut {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(step) => erase(step),
        Err(payload) => StepOut::Fail(Failure::from_panic(payload)),
    }
}

pub(crate) fn then<T, U, S>(
    parent: Deferred<T>,
    on_fulfil: impl FnOnce(T) -> S + 'static,
) -> Deferred<U>
where
    T: 'static,
    U: 'static,
    S: Into<Step<U>>,
{
    frame::with_frame(|frame| {
        frame.check_barrier(parent.barrier(), parent.node());
        let f: ThenFn = Box::new(move |payload| {
            let value = take_payload::<T>(payload);
            run_user(move || on_fulfil(value).into())
        });
        let child = frame.insert(Reaction::Then(Some(f)));
        frame.link(parent.node(), child);
        Deferred::from_parts(frame.barrier, child)
    })
}

pub(crate) fn catch<T, S>(
    parent: Deferred<T>,
    kinds: Option<Vec<ErrorKind>>,
    on_reject: impl FnOnce(Failure) -> S + 'static,
) -> Deferred<T>
where
    T: 'static,
    S: Into<Step<T>>,
{
    frame::with_frame(|frame| {
        frame.check_barrier(parent.barrier(), parent.node());
        let f: CatchFn = Box::new(move |failure| run_user(move || on_reject(failure).into()));
        let child = frame.insert(Reaction::Catch {
            handler: Some(f),
            kinds,
        });
        frame.link(parent.node(), child);
        Deferred::from_parts(frame.barrier, child)
    })
}

pub(crate) fn finally<T, S>(
    parent: Deferred<T>,
    on_final: impl FnOnce() -> S + 'static,
) -> Deferred<T>
where
    T: 'static,
    S: Into<Step<()>>,
{
    frame::with_frame(|frame| {
        frame.check_barrier(parent.barrier(), parent.node());
        let f: FinalFn = Box::new(move || run_user(move || on_final().into()));
        let child = frame.insert(Reaction::Finally {
            handler: Some(f),
            stashed: None,
        });
        frame.link(parent.node(), child);
        Deferred::from_parts(frame.barrier, child)
    })
}

pub(crate) fn share<T: 'static>(parent: Deferred<T>) -> SharedDeferred<T> {
    frame::with_frame(|frame| {
        frame.check_barrier(parent.barrier(), parent.node());
        let node = frame.node_mut(parent.node());
        if node.children != Children::None {
            misuse(
                ErrorKind::Ownership,
                format!("cannot share deferred {}: it already has a consumer", parent.node()),
            );
        }
        node.shared = true;
        node.children = Children::Shared(Vec::new());
        SharedDeferred::from_parts(frame.barrier, parent.node())
    })
}

pub(crate) fn subscribe<T: Clone + 'static>(shared: &SharedDeferred<T>) -> Deferred<T> {
    frame::with_frame(|frame| {
        frame.check_barrier(shared.barrier(), shared.node());
        let dup: DupFn = Box::new(|payload| {
            let value = payload
                .downcast_ref::<T>()
                .unwrap_or_else(|| panic!("shared deferred settled with an unexpected payload type"));
            Rc::new(value.clone())
        });
        let child = frame.insert(Reaction::Subscribe { dup });
        frame.link(shared.node(), child);
        Deferred::from_parts(frame.barrier, child)
    })
}

/// Fulfils with every parent result in input order once all parents fulfil;
/// rejects with the first rejection and cancels the parents still pending.
pub fn when_all<T: 'static>(parents: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    frame::with_frame(|frame| {
        for parent in &parents {
            frame.check_barrier(parent.barrier(), parent.node());
        }
        let count = parents.len();
        let assemble: FinishFn = Box::new(|values| {
            let collected: Vec<T> = values.into_iter().map(take_payload::<T>).collect();
            Rc::new(collected)
        });
        let child = frame.insert(Reaction::All {
            slots: (0..count).map(|_| None).collect(),
            remaining: count,
            finish: Some(assemble),
        });
        for parent in &parents {
            frame.link(parent.node(), child);
        }
        if count == 0 {
            frame.finish(child, Ok(Rc::new(Vec::<T>::new())), NodeState::Fulfilled);
        }
        Deferred::from_parts(frame.barrier, child)
    })
}

/// Fulfils with the first parent result and cancels the rest; rejects only
/// once every parent has rejected, aggregating their failures in index order.
pub fn when_any<T: 'static>(parents: Vec<Deferred<T>>) -> Deferred<T> {
    frame::with_frame(|frame| {
        for parent in &parents {
            frame.check_barrier(parent.barrier(), parent.node());
        }
        let count = parents.len();
        let child = frame.insert(Reaction::Any {
            failures: (0..count).map(|_| None).collect(),
            remaining: count,
        });
        for parent in &parents {
            frame.link(parent.node(), child);
        }
        if count == 0 {
            frame.finish(child, Err(Failure::all_failed(Vec::new())), NodeState::Rejected);
        }
        Deferred::from_parts(frame.barrier, child)
    })
}

/// Fulfils with the first `need` parent results in settlement order; rejects
/// with `insufficient` as soon as that many successes are impossible. Either
/// way the parents still pending are cancelled.
pub fn when_some<T: 'static>(need: usize, parents: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    frame::with_frame(|frame| {
        for parent in &parents {
            frame.check_barrier(parent.barrier(), parent.node());
        }
        let count = parents.len();
        let assemble: FinishFn = Box::new(|values| {
            let collected: Vec<T> = values.into_iter().map(take_payload::<T>).collect();
            Rc::new(collected)
        });
        let child = frame.insert(Reaction::Some {
            need,
            taken: Vec::new(),
            failures: Vec::new(),
            remaining: count,
            finish: Some(assemble),
        });
        let parent_ids: Vec<_> = parents.iter().map(|p| p.node()).collect();
        for parent in &parents {
            frame.link(parent.node(), child);
        }
        if need == 0 {
            frame.finish(child, Ok(Rc::new(Vec::<T>::new())), NodeState::Fulfilled);
            cancel_set(frame, parent_ids, "when_some needs no results", CancelScope::Auto);
        } else if count < need {
            frame.finish(
                child,
                Err(Failure::insufficient(need, Vec::new())),
                NodeState::Rejected,
            );
            cancel_set(frame, parent_ids, "when_some can never succeed", CancelScope::Auto);
        }
        Deferred::from_parts(frame.barrier, child)
    })
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::barrier::synchronise;
    use crate::source::SourceCtx;

    /// Counters observed from outside the barrier.
    #[derive(Clone, Default)]
    struct ProbeStats {
        started: Rc<Cell<u32>>,
        aborted: Rc<Cell<u32>>,
    }

    /// Test source that counts starts and aborts; settles with `emit` if
    /// given, otherwise stays running forever.
    struct Probe {
        stats: ProbeStats,
        emit: Option<i32>,
    }

    impl Source for Probe {
        fn start(&mut self, ctx: &mut SourceCtx<'_>) {
            self.stats.started.set(self.stats.started.get() + 1);
            if let Some(value) = self.emit.take() {
                ctx.fulfil(value);
            }
        }

        fn abort(&mut self, _ctx: &mut SourceCtx<'_>) {
            self.stats.aborted.set(self.stats.aborted.get() + 1);
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn constant_fulfils_through_a_barrier() {
        assert_eq!(synchronise(|| constant(42)), Ok(42));
    }

    #[test]
    fn then_maps_the_parent_result() {
        let result = synchronise(|| constant(2).then(|x: i32| x * 3).then(|x: i32| x + 1));
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn failed_rejects_with_its_failure() {
        let err = synchronise(|| failed::<i32>(Failure::timeout("gave up"))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.message, "gave up");
    }

    #[test]
    fn rejections_skip_then_callbacks() {
        let ran = Rc::new(Cell::new(false));
        let ran_in = Rc::clone(&ran);
        let err = synchronise(|| {
            failed::<i32>(Failure::new(ErrorKind::User, "boom")).then(move |x: i32| {
                ran_in.set(true);
                x
            })
        })
        .unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(!ran.get());
    }

    #[test]
    fn deep_then_chain_settles_iteratively() {
        let result = synchronise(|| {
            let mut d = constant(0);
            for _ in 0..5_000 {
                d = d.then(|x: i32| x + 1);
            }
            d
        });
        assert_eq!(result, Ok(5_000));
    }

    #[test]
    fn absorption_settles_deep_chains_of_returned_deferreds() {
        let result = synchronise(|| {
            let mut d = constant(0);
            for _ in 0..2_000 {
                d = d.then(|x: i32| constant(x + 1));
            }
            d
        });
        assert_eq!(result, Ok(2_000));
    }

    #[test]
    fn callback_panics_are_caught_by_catch() {
        let result = synchronise(|| {
            constant(1)
                .then(|_: i32| -> i32 { panic!("bad") })
                .catch(|_| 0)
        });
        assert_eq!(result, Ok(0));
    }

    #[test]
    fn uncaught_callback_panics_surface_as_user_failures() {
        let err = synchronise(|| constant(1).then(|_: i32| -> i32 { panic!("bad") })).unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert!(err.message.contains("bad"));
    }

    #[test]
    fn catch_kinds_lets_unmatched_failures_through() {
        let err = synchronise(|| {
            failed::<i32>(Failure::timeout("slow"))
                .catch_kinds(&[ErrorKind::User], |_| 0)
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);

        let result = synchronise(|| {
            failed::<i32>(Failure::timeout("slow"))
                .catch_kinds(&[ErrorKind::Timeout], |_| 0)
        });
        assert_eq!(result, Ok(0));
    }

    #[test]
    fn catch_callbacks_that_panic_reject_with_user_kind() {
        let err = synchronise(|| {
            failed::<i32>(Failure::timeout("slow")).catch(|_| -> i32 { panic!("worse") })
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert!(err.message.contains("worse"));
    }

    #[test]
    fn finally_runs_on_both_paths_and_preserves_the_outcome() {
        let runs = Rc::new(Cell::new(0));

        let runs_ok = Rc::clone(&runs);
        let result = synchronise(|| {
            constant(9).finally(move || {
                runs_ok.set(runs_ok.get() + 1);
            })
        });
        assert_eq!(result, Ok(9));

        let runs_err = Rc::clone(&runs);
        let err = synchronise(|| {
            failed::<i32>(Failure::new(ErrorKind::User, "kept")).finally(move || {
                runs_err.set(runs_err.get() + 1);
            })
        })
        .unwrap_err();
        assert_eq!(err.message, "kept");
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn a_failing_finally_replaces_the_outcome() {
        let err = synchronise(|| {
            constant(9).finally(|| Step::<()>::fail(Failure::new(ErrorKind::User, "cleanup failed")))
        })
        .unwrap_err();
        assert_eq!(err.message, "cleanup failed");
    }

    #[test]
    fn a_finally_returning_a_rejecting_deferred_replaces_the_outcome() {
        let err = synchronise(|| {
            constant(9).finally(|| failed::<()>(Failure::new(ErrorKind::User, "late cleanup failure")))
        })
        .unwrap_err();
        assert_eq!(err.message, "late cleanup failure");

        // A fulfilling deferred restores the stashed outcome instead.
        let result = synchronise(|| constant(9).finally(|| delay(ms(5))));
        assert_eq!(result, Ok(9));
    }

    #[test]
    fn when_all_results_keep_input_order() {
        let result = synchronise(|| {
            let a = delay(ms(30)).then(|_| 1);
            let b = delay(ms(5)).then(|_| 2);
            let c = delay(ms(15)).then(|_| 3);
            when_all(vec![a, b, c])
        });
        assert_eq!(result, Ok(vec![1, 2, 3]));
    }

    #[test]
    fn when_all_rejects_on_first_rejection_and_aborts_pending_parents() {
        let stats = ProbeStats::default();
        let stats_in = stats.clone();
        let err = synchronise(|| {
            let hung = from_source::<i32>(Probe {
                stats: stats_in,
                emit: None,
            });
            let doomed = failed::<i32>(Failure::new(ErrorKind::User, "first"));
            when_all(vec![hung, doomed])
        })
        .unwrap_err();
        assert_eq!(err.message, "first");
        assert_eq!(stats.started.get(), 1);
        assert_eq!(stats.aborted.get(), 1);
    }

    #[test]
    fn when_any_first_wins_and_the_slow_branch_observes_cancellation() {
        let seen = Rc::new(RefCell::new(None));
        let seen_in = Rc::clone(&seen);
        let result = synchronise(|| {
            let slow = delay(ms(300)).share();
            let _observer = slow.catch(move |failure| {
                *seen_in.borrow_mut() = Some(failure.kind);
            });
            let fast = delay(ms(10)).then(|_| 'A');
            let slow_branch = slow.then(|_| 'B');
            when_any(vec![fast, slow_branch])
        });
        assert_eq!(result, Ok('A'));
        assert_eq!(*seen.borrow(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn when_any_aggregates_failures_in_index_order() {
        let err = synchronise(|| {
            let a = failed::<i32>(Failure::new(ErrorKind::User, "a"));
            let b = failed::<i32>(Failure::timeout("b"));
            when_any(vec![a, b])
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AllFailed);
        assert_eq!(err.causes.len(), 2);
        assert_eq!(err.causes[0].message, "a");
        assert_eq!(err.causes[1].message, "b");
    }

    #[test]
    fn when_some_fulfils_in_settlement_order_and_cancels_the_rest() {
        let result = synchronise(|| {
            let a = delay(ms(50)).then(|_| 1);
            let b = delay(ms(5)).then(|_| 2);
            let c = delay(ms(15)).then(|_| 3);
            when_some(2, vec![a, b, c])
        });
        assert_eq!(result, Ok(vec![2, 3]));
    }

    #[test]
    fn when_some_rejects_once_the_quota_is_impossible() {
        let err = synchronise(|| {
            let a = failed::<i32>(Failure::new(ErrorKind::User, "a"));
            let b = failed::<i32>(Failure::new(ErrorKind::User, "b"));
            let c = delay(ms(50)).then(|_| 3);
            when_some(2, vec![a, b, c])
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Insufficient);
        assert_eq!(err.causes.len(), 2);
    }

    #[test]
    fn empty_joins_settle_without_parents() {
        assert_eq!(synchronise(|| when_all(Vec::<Deferred<i32>>::new())), Ok(vec![]));
        assert_eq!(synchronise(|| when_some(0, Vec::<Deferred<i32>>::new())), Ok(vec![]));

        let err = synchronise(|| when_any(Vec::<Deferred<i32>>::new())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AllFailed);
        assert!(err.causes.is_empty());
    }

    #[test]
    fn share_multicasts_one_settlement_to_every_subscriber() {
        let stats = ProbeStats::default();
        let stats_in = stats.clone();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let result = synchronise(|| {
            let shared = from_source::<i32>(Probe {
                stats: stats_in,
                emit: Some(7),
            })
            .share();
            let mut tails = Vec::new();
            for _ in 0..3 {
                let hits_in = Rc::clone(&hits);
                tails.push(shared.then(move |v: i32| {
                    hits_in.borrow_mut().push(v);
                    v
                }));
            }
            when_all(tails)
        });
        assert_eq!(result, Ok(vec![7, 7, 7]));
        assert_eq!(*hits.borrow(), vec![7, 7, 7]);
        assert_eq!(stats.started.get(), 1);
    }

    #[test]
    fn late_subscribers_still_see_the_shared_settlement() {
        let result = synchronise(|| {
            let shared = constant(1).share();
            shared
                .subscribe()
                .then::<i32, _>(move |v: i32| shared.subscribe().then(move |w: i32| v + w))
        });
        assert_eq!(result, Ok(2));
    }

    #[test]
    #[should_panic(expected = "ownership violation")]
    fn a_second_consumer_of_a_non_shared_deferred_panics() {
        let _ = synchronise(|| {
            let d = constant(1);
            let first = d.then(|x: i32| x);
            let _second = d.then(|x: i32| x);
            first
        });
    }

    #[test]
    fn unconsumed_deferreds_are_never_started() {
        let stats = ProbeStats::default();
        let stats_in = stats.clone();
        let result = synchronise(|| {
            let _orphan = from_source::<i32>(Probe {
                stats: stats_in,
                emit: Some(1),
            });
            constant(5)
        });
        assert_eq!(result, Ok(5));
        assert_eq!(stats.started.get(), 0);
    }
}
