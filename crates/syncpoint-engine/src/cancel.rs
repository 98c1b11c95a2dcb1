use syncpoint_types::{Failure, NodeId, NodeState};
use tracing::trace;

use crate::frame::Frame;
use crate::node::{Children, Reaction};
use crate::source::SourceCtx;

/// Why a cancellation walk is running; shared nodes are only collected at
/// barrier teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelScope {
    /// A consumer decided the results are no longer needed.
    Auto,
    /// The barrier is ending; everything still live must be torn down.
    Teardown,
}

/// Propagates cancellation from `seeds` up through exclusively-owned parents.
///
/// Each visited node is settled as cancelled (its consumers and observers see
/// the settlement), its producer is aborted if running and then dropped, and
/// the walk continues into parents whose only child was the visited node.
/// Terminal nodes stop the walk; shared nodes stop it too unless the barrier
/// is tearing down.
pub(crate) fn cancel_set(frame: &mut Frame, seeds: Vec<NodeId>, reason: &str, scope: CancelScope) {
    let mut stack = seeds;
    while let Some(id) = stack.pop() {
        {
            let node = frame.node_mut(id);
            if node.is_terminal() {
                continue;
            }
            if node.shared && scope == CancelScope::Auto {
                continue;
            }
            node.cancel_requested = true;
        }
        trace!(barrier = %frame.barrier, node = %id, reason, "cancelling deferred");

        abort_producer(frame, id);
        frame.finish(id, Err(Failure::cancelled(reason)), NodeState::Cancelled);

        let parents = frame.node(id).parents.clone();
        for parent in parents {
            let parent_node = frame.node(parent);
            let exclusive =
                !parent_node.shared && parent_node.children == Children::One(id);
            if exclusive {
                stack.push(parent);
            }
        }
    }
}

/// Calls the producer's abort hook if it ever started, then drops the
/// producer so it cannot settle later. Settlements raced in during the abort
/// call itself are discarded.
fn abort_producer(frame: &mut Frame, id: NodeId) {
    let started = frame.node(id).started;
    let mut source = match &mut frame.node_mut(id).reaction {
        Reaction::Source(slot) => slot.take(),
        _ => None,
    };
    let Some(mut src) = source.take() else {
        return;
    };
    if started {
        let mut discarded = None;
        let mut ctx = SourceCtx {
            node: id,
            reactor: &mut frame.reactor,
            settled: &mut discarded,
        };
        src.abort(&mut ctx);
    }
    // The producer is dropped here; `finish` releases any registrations the
    // abort hook left behind.
}
