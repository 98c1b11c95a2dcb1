use std::any::Any;
use std::rc::Rc;

use syncpoint_types::{BarrierId, ErrorKind, Failure, NodeId, NodeState};

use crate::source::Source;

/// A settled value, type-erased inside the engine.
///
/// The typed public API wraps and unwraps this at the combinator boundary.
/// Exclusive parent-to-child handoff moves the `Rc` (unique by construction);
/// shared nodes multicast clones of it.
pub(crate) type Payload = Rc<dyn Any>;

/// Outcome of a settlement: a payload or a structured failure.
pub(crate) type Settlement = Result<Payload, Failure>;

/// Result of running a user callback, with the types erased.
pub(crate) enum StepOut {
    /// Settle the child with this payload.
    Now(Payload),
    /// Settle the child with this failure.
    Fail(Failure),
    /// Absorb: re-parent the child onto another deferred and adopt its
    /// outcome when it settles.
    Wait { barrier: BarrierId, node: NodeId },
}

pub(crate) type ThenFn = Box<dyn FnOnce(Payload) -> StepOut>;
pub(crate) type CatchFn = Box<dyn FnOnce(Failure) -> StepOut>;
pub(crate) type FinalFn = Box<dyn FnOnce() -> StepOut>;

/// Re-boxes a multicast payload into uniquely owned form (`T::clone` under
/// the erasure).
pub(crate) type DupFn = Box<dyn Fn(&dyn Any) -> Payload>;

/// Assembles a join result from collected parent payloads.
pub(crate) type FinishFn = Box<dyn FnOnce(Vec<Payload>) -> Payload>;

/// Consumers of a node's settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Children {
    /// Not yet consumed. Roots and lazy orphans stay here.
    None,
    /// The single owning child of a non-shared node.
    One(NodeId),
    /// Children of a shared node, in attachment order.
    Shared(Vec<NodeId>),
}

/// How a node reacts to being started or to a parent settlement.
pub(crate) enum Reaction {
    /// Leaf backed by a source adapter. The slot is taken while the adapter
    /// runs and dropped for good once the node is cancelled.
    Source(Option<Box<dyn Source>>),
    /// `then`: run the callback on fulfilment, pass rejections through.
    Then(Option<ThenFn>),
    /// `catch`: run the callback on a matching rejection, pass everything
    /// else through.
    Catch {
        handler: Option<CatchFn>,
        kinds: Option<Vec<ErrorKind>>,
    },
    /// `finally`: stash the parent outcome, run the callback, then settle
    /// with the stashed outcome unless the callback replaced it.
    Finally {
        handler: Option<FinalFn>,
        stashed: Option<Settlement>,
    },
    /// Absorption target: adopt the sole parent's settlement verbatim.
    Forward,
    /// Child of a shared node: duplicate the multicast payload into unique
    /// ownership before passing it on.
    Subscribe { dup: DupFn },
    /// `when_all`: collect every parent result in input order.
    All {
        slots: Vec<Option<Payload>>,
        remaining: usize,
        finish: Option<FinishFn>,
    },
    /// `when_any`: first fulfilment wins; reject only when all parents have.
    Any {
        failures: Vec<Option<Failure>>,
        remaining: usize,
    },
    /// `when_some`: first `need` fulfilments win, in settlement order.
    Some {
        need: usize,
        taken: Vec<Payload>,
        failures: Vec<Failure>,
        remaining: usize,
        finish: Option<FinishFn>,
    },
}

/// One deferred value: state machine, links, and reaction.
pub(crate) struct Node {
    pub state: NodeState,
    /// Present once settled, until handed to the exclusive consumer (or, for
    /// shared nodes and roots, until the barrier ends).
    pub outcome: Option<Settlement>,
    pub reaction: Reaction,
    /// Nodes this one consumes from. Empty for sources.
    pub parents: Vec<NodeId>,
    pub children: Children,
    pub shared: bool,
    pub cancel_requested: bool,
    /// Transitively reachable from the barrier root via parent edges.
    pub reachable: bool,
    /// The producer has been started; guards double starts.
    pub started: bool,
}

impl Node {
    pub fn new(reaction: Reaction) -> Self {
        Self {
            state: NodeState::Pending,
            outcome: None,
            reaction,
            parents: Vec::new(),
            children: Children::None,
            shared: false,
            cancel_requested: false,
            reachable: false,
            started: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
