use std::cell::RefCell;
use std::rc::Rc;

use syncpoint_types::{Failure, NodeId, NodeState};
use tracing::trace;

use crate::cancel::{CancelScope, cancel_set};
use crate::frame::{Delivery, Frame};
use crate::node::{CatchFn, FinalFn, Reaction, Settlement, StepOut, ThenFn};
use crate::reactor::Fired;
use crate::source::{Firing, SourceCtx};

/// A user callback extracted from the graph, runnable without holding the
/// frame borrow (callbacks re-enter the public API and may open nested
/// barriers).
pub(crate) enum UserJob {
    Then {
        child: NodeId,
        f: ThenFn,
        payload: crate::node::Payload,
    },
    Catch {
        child: NodeId,
        f: CatchFn,
        failure: Failure,
    },
    Finally {
        child: NodeId,
        f: FinalFn,
    },
}

/// What `apply_delivery` decided, executed after the node borrow is dropped.
enum After {
    Nothing,
    Job(UserJob),
    Settle(Settlement, NodeState),
    SettleAndCancel {
        settlement: Settlement,
        state: NodeState,
        drop_parents: Vec<NodeId>,
        reason: &'static str,
    },
}

/// Pops deliveries, resolving engine-internal reactions inline, until a user
/// callback surfaces or the queue drains. FIFO order is preserved: internal
/// reactions enqueue their own downstream deliveries at the tail.
pub(crate) fn next_user_job(frame: &mut Frame) -> Option<UserJob> {
    while let Some(delivery) = frame.ready.pop_front() {
        if let Some(job) = apply_delivery(frame, delivery) {
            return Some(job);
        }
    }
    None
}

fn apply_delivery(frame: &mut Frame, delivery: Delivery) -> Option<UserJob> {
    let Delivery {
        child,
        parent,
        settlement,
    } = delivery;

    let after = {
        let node = frame.node_mut(child);
        // A join that already decided, or a branch cancellation racing a
        // settlement: the consumer is gone, the delivery is moot.
        if node.is_terminal() || node.cancel_requested {
            return None;
        }

        match &mut node.reaction {
            // Sources have no parents; nothing ever delivers to them.
            Reaction::Source(_) => After::Nothing,

            Reaction::Then(slot) => match settlement {
                Ok(payload) => match slot.take() {
                    Some(f) => {
                        node.state = NodeState::Running;
                        After::Job(UserJob::Then { child, f, payload })
                    }
                    None => After::Nothing,
                },
                // Rejections skip the callback and flow through unmodified.
                Err(failure) => After::Settle(Err(failure), NodeState::Rejected),
            },

            Reaction::Catch { handler, kinds } => match settlement {
                Ok(payload) => After::Settle(Ok(payload), NodeState::Fulfilled),
                Err(failure) => {
                    let matches = kinds
                        .as_ref()
                        .is_none_or(|filter| filter.contains(&failure.kind));
                    match (matches, handler.take()) {
                        (true, Some(f)) => {
                            node.state = NodeState::Running;
                            After::Job(UserJob::Catch { child, f, failure })
                        }
                        _ => After::Settle(Err(failure), NodeState::Rejected),
                    }
                }
            },

            Reaction::Finally { handler, stashed } => match handler.take() {
                // First phase: stash the parent outcome, run the callback.
                Some(f) => {
                    *stashed = Some(settlement);
                    node.state = NodeState::Running;
                    After::Job(UserJob::Finally { child, f })
                }
                // Second phase: the callback returned a deferred. Its
                // rejection replaces the stashed outcome; its fulfilment
                // restores it.
                None => match settlement {
                    Err(failure) => After::Settle(Err(failure), NodeState::Rejected),
                    Ok(_) => match stashed.take() {
                        Some(Ok(payload)) => After::Settle(Ok(payload), NodeState::Fulfilled),
                        Some(Err(failure)) => After::Settle(Err(failure), NodeState::Rejected),
                        None => After::Nothing,
                    },
                },
            },

            Reaction::Forward => match settlement {
                Ok(payload) => After::Settle(Ok(payload), NodeState::Fulfilled),
                Err(failure) => After::Settle(Err(failure), NodeState::Rejected),
            },

            Reaction::Subscribe { dup } => match settlement {
                Ok(payload) => After::Settle(Ok(dup(&*payload)), NodeState::Fulfilled),
                Err(failure) => After::Settle(Err(failure), NodeState::Rejected),
            },

            Reaction::All {
                slots,
                remaining,
                finish,
            } => {
                let index = parent_index(&node.parents, parent);
                match settlement {
                    Ok(payload) => {
                        if slots[index].is_none() {
                            slots[index] = Some(payload);
                            *remaining -= 1;
                        }
                        if *remaining == 0 {
                            let values = slots.iter_mut().map(|s| s.take()).collect::<Option<Vec<_>>>();
                            match (values, finish.take()) {
                                (Some(values), Some(assemble)) => {
                                    After::Settle(Ok(assemble(values)), NodeState::Fulfilled)
                                }
                                _ => After::Nothing,
                            }
                        } else {
                            After::Nothing
                        }
                    }
                    Err(failure) => After::SettleAndCancel {
                        settlement: Err(failure),
                        state: NodeState::Rejected,
                        drop_parents: node.parents.clone(),
                        reason: "a when_all parent rejected",
                    },
                }
            }

            Reaction::Any {
                failures,
                remaining,
            } => match settlement {
                Ok(payload) => After::SettleAndCancel {
                    settlement: Ok(payload),
                    state: NodeState::Fulfilled,
                    drop_parents: node.parents.clone(),
                    reason: "a when_any parent won",
                },
                Err(failure) => {
                    let index = parent_index(&node.parents, parent);
                    if failures[index].is_none() {
                        failures[index] = Some(failure);
                        *remaining -= 1;
                    }
                    if *remaining == 0 {
                        let causes = failures.iter_mut().filter_map(|f| f.take()).collect();
                        After::Settle(Err(Failure::all_failed(causes)), NodeState::Rejected)
                    } else {
                        After::Nothing
                    }
                }
            },

            Reaction::Some {
                need,
                taken,
                failures,
                remaining,
                finish,
            } => {
                *remaining -= 1;
                match settlement {
                    Ok(payload) => {
                        taken.push(payload);
                        if taken.len() == *need {
                            let values = std::mem::take(taken);
                            match finish.take() {
                                Some(assemble) => After::SettleAndCancel {
                                    settlement: Ok(assemble(values)),
                                    state: NodeState::Fulfilled,
                                    drop_parents: node.parents.clone(),
                                    reason: "when_some reached its quota",
                                },
                                None => After::Nothing,
                            }
                        } else {
                            After::Nothing
                        }
                    }
                    Err(failure) => {
                        failures.push(failure);
                        if taken.len() + *remaining < *need {
                            let causes = std::mem::take(failures);
                            After::SettleAndCancel {
                                settlement: Err(Failure::insufficient(*need, causes)),
                                state: NodeState::Rejected,
                                drop_parents: node.parents.clone(),
                                reason: "when_some can no longer succeed",
                            }
                        } else {
                            After::Nothing
                        }
                    }
                }
            }
        }
    };

    match after {
        After::Nothing => None,
        After::Job(job) => Some(job),
        After::Settle(settlement, state) => {
            frame.finish(child, settlement, state);
            None
        }
        After::SettleAndCancel {
            settlement,
            state,
            drop_parents,
            reason,
        } => {
            frame.finish(child, settlement, state);
            cancel_set(frame, drop_parents, reason, CancelScope::Auto);
            None
        }
    }
}

fn parent_index(parents: &[NodeId], parent: NodeId) -> usize {
    parents
        .iter()
        .position(|p| *p == parent)
        .unwrap_or_else(|| panic!("delivery from {parent}, which is not a parent of this join"))
}

/// Runs one extracted user callback and commits its step. No frame borrow is
/// held while the callback executes.
pub(crate) fn perform(frame_rc: &Rc<RefCell<Frame>>, job: UserJob) {
    match job {
        UserJob::Then { child, f, payload } => {
            let out = f(payload);
            commit_step(frame_rc, child, out);
        }
        UserJob::Catch { child, f, failure } => {
            let out = f(failure);
            commit_step(frame_rc, child, out);
        }
        UserJob::Finally { child, f } => {
            let out = f();
            commit_finally(frame_rc, child, out);
        }
    }
}

fn commit_step(frame_rc: &Rc<RefCell<Frame>>, child: NodeId, out: StepOut) {
    let mut frame = frame_rc.borrow_mut();
    match out {
        StepOut::Now(payload) => frame.finish(child, Ok(payload), NodeState::Fulfilled),
        StepOut::Fail(failure) => frame.finish(child, Err(failure), NodeState::Rejected),
        StepOut::Wait { barrier, node } => {
            frame.check_barrier(barrier, node);
            absorb(&mut frame, child, node);
        }
    }
}

fn commit_finally(frame_rc: &Rc<RefCell<Frame>>, child: NodeId, out: StepOut) {
    let mut frame = frame_rc.borrow_mut();
    match out {
        // The callback's own value is discarded; the stashed parent outcome
        // stands.
        StepOut::Now(_) => {
            let stashed = match &mut frame.node_mut(child).reaction {
                Reaction::Finally { stashed, .. } => stashed.take(),
                _ => None,
            };
            match stashed {
                Some(Ok(payload)) => frame.finish(child, Ok(payload), NodeState::Fulfilled),
                Some(Err(failure)) => frame.finish(child, Err(failure), NodeState::Rejected),
                None => {}
            }
        }
        StepOut::Fail(failure) => frame.finish(child, Err(failure), NodeState::Rejected),
        // Wait for the returned deferred; the stashed outcome is resolved in
        // the second Finally phase of `apply_delivery`.
        StepOut::Wait { barrier, node } => {
            frame.check_barrier(barrier, node);
            adopt_and_reach(&mut frame, node, child);
        }
    }
}

/// Re-parents `child` onto `inner` so it adopts that deferred's settlement
/// ("promise absorption"). Works iteratively through the ready queue, so
/// chains of any depth settle without growing the stack.
fn absorb(frame: &mut Frame, child: NodeId, inner: NodeId) {
    frame.node_mut(child).reaction = Reaction::Forward;
    adopt_and_reach(frame, inner, child);
}

fn adopt_and_reach(frame: &mut Frame, parent: NodeId, child: NodeId) {
    frame.link(parent, child);
    frame.mark_reachable(parent);
}

/// Starts every queued reachable producer. New entries may appear while the
/// ready queue drains (absorption adopts fresh sources); called once per
/// drain iteration.
pub(crate) fn start_pending(frame: &mut Frame) {
    while let Some(id) = frame.pending_start.pop_front() {
        let node = frame.node_mut(id);
        if node.started || node.state != NodeState::Pending || node.cancel_requested {
            continue;
        }
        node.started = true;
        node.state = NodeState::Running;
        let mut source = match &mut node.reaction {
            Reaction::Source(slot) => slot.take(),
            _ => None,
        };
        let Some(mut src) = source.take() else {
            continue;
        };
        trace!(barrier = %frame.barrier, node = %id, "starting producer");

        let mut settled = None;
        {
            let mut ctx = SourceCtx {
                node: id,
                reactor: &mut frame.reactor,
                settled: &mut settled,
            };
            src.start(&mut ctx);
        }
        if let Reaction::Source(slot) = &mut frame.node_mut(id).reaction {
            *slot = Some(src);
        }
        apply_source_settlement(frame, id, settled);
    }
}

/// Routes reactor events to their sources and applies the settlements they
/// produce. Thread-marshalled settlements bypass the source entirely.
pub(crate) fn dispatch(frame: &mut Frame, fired: Vec<Fired>) {
    for event in fired {
        match event {
            Fired::Wake { node, outcome } => {
                let target = frame.node_mut(node);
                if target.is_terminal() || target.cancel_requested {
                    continue;
                }
                let settlement = outcome.map(|boxed| {
                    let erased: Box<dyn std::any::Any> = boxed;
                    std::rc::Rc::from(erased)
                });
                match settlement {
                    Ok(payload) => frame.finish(node, Ok(payload), NodeState::Fulfilled),
                    Err(failure) => frame.finish(node, Err(failure), NodeState::Rejected),
                }
            }
            Fired::Source { node, firing } => {
                let target = frame.node_mut(node);
                if target.is_terminal() || target.cancel_requested {
                    continue;
                }
                let mut source = match &mut target.reaction {
                    Reaction::Source(slot) => slot.take(),
                    _ => None,
                };
                let Some(mut src) = source.take() else {
                    continue;
                };

                let mut settled = None;
                {
                    let mut ctx = SourceCtx {
                        node,
                        reactor: &mut frame.reactor,
                        settled: &mut settled,
                    };
                    src.on_ready(firing, &mut ctx);
                }
                if let Reaction::Source(slot) = &mut frame.node_mut(node).reaction {
                    *slot = Some(src);
                }
                apply_source_settlement(frame, node, settled);

                // Oneshot io registrations stay quiet until re-armed; a
                // settlement has already released them.
                if let Firing::Io { token, .. } = firing {
                    frame.reactor.rearm_io(token);
                }
            }
        }
    }
}

fn apply_source_settlement(frame: &mut Frame, node: NodeId, settled: Option<Settlement>) {
    match settled {
        Some(Ok(payload)) => frame.finish(node, Ok(payload), NodeState::Fulfilled),
        Some(Err(failure)) => frame.finish(node, Err(failure), NodeState::Rejected),
        None => {}
    }
}
