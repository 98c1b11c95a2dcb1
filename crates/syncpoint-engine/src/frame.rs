use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use slab::Slab;
use syncpoint_types::{BarrierId, ErrorKind, NodeId, NodeState};
use tracing::trace;

use crate::node::{Children, Node, Reaction, Settlement};
use crate::reactor::Reactor;

/// A settlement travelling from a parent to one consumer, FIFO through the
/// ready queue.
pub(crate) struct Delivery {
    pub child: NodeId,
    pub parent: NodeId,
    pub settlement: Settlement,
}

/// Per-barrier state: the node arena, the ready queue, and the reactor.
///
/// One frame is pushed per `synchronise` call; frames nest on a thread-local
/// stack and the innermost frame is the only one whose loop runs.
pub(crate) struct Frame {
    pub barrier: BarrierId,
    pub nodes: Slab<Node>,
    pub ready: VecDeque<Delivery>,
    /// Reachable source nodes awaiting their producer start.
    pub pending_start: VecDeque<NodeId>,
    pub reactor: Reactor,
    pub root: Option<NodeId>,
    pub interrupt_flag: Arc<AtomicBool>,
    /// An interrupt handle escaped to user code; disables stall detection.
    pub interrupt_taken: bool,
}

static NEXT_BARRIER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static FRAMES: RefCell<Vec<Rc<RefCell<Frame>>>> = const { RefCell::new(Vec::new()) };
}

/// Panic with the message shape used for non-recoverable programmer errors.
pub(crate) fn misuse(kind: ErrorKind, detail: impl std::fmt::Display) -> ! {
    panic!("{kind} violation: {detail}")
}

/// Pushes a fresh barrier frame and makes it current for this thread.
pub(crate) fn push_frame() -> io::Result<Rc<RefCell<Frame>>> {
    let frame = Rc::new(RefCell::new(Frame {
        barrier: BarrierId::from_raw(NEXT_BARRIER.fetch_add(1, Ordering::Relaxed)),
        nodes: Slab::new(),
        ready: VecDeque::new(),
        pending_start: VecDeque::new(),
        reactor: Reactor::new()?,
        root: None,
        interrupt_flag: Arc::new(AtomicBool::new(false)),
        interrupt_taken: false,
    }));
    FRAMES.with(|stack| stack.borrow_mut().push(Rc::clone(&frame)));
    Ok(frame)
}

/// Pops the innermost frame; the frame being torn down must be on top.
pub(crate) fn pop_frame(expected: BarrierId) {
    FRAMES.with(|stack| {
        let mut stack = stack.borrow_mut();
        debug_assert!(
            stack.last().map(|f| f.borrow().barrier) == Some(expected),
            "barrier frames must unwind innermost-first"
        );
        if stack.last().map(|f| f.borrow().barrier) == Some(expected) {
            stack.pop();
        }
    });
}

/// The innermost active frame; panics outside any `synchronise`.
pub(crate) fn current() -> Rc<RefCell<Frame>> {
    FRAMES
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| {
            misuse(
                ErrorKind::CrossBarrier,
                "no synchronisation barrier is active on this thread",
            )
        })
}

/// Runs `f` against the innermost frame with the borrow released afterwards.
pub(crate) fn with_frame<R>(f: impl FnOnce(&mut Frame) -> R) -> R {
    let frame = current();
    let mut frame = frame.borrow_mut();
    f(&mut frame)
}

impl Frame {
    /// Rejects a handle from a different barrier before it can touch this
    /// frame's arena.
    pub fn check_barrier(&self, handle_barrier: BarrierId, node: NodeId) {
        if handle_barrier != self.barrier {
            misuse(
                ErrorKind::CrossBarrier,
                format!("deferred {handle_barrier}.{node} used inside barrier {}", self.barrier),
            );
        }
    }

    pub fn insert(&mut self, reaction: Reaction) -> NodeId {
        let id = NodeId::from_index(self.nodes.insert(Node::new(reaction)));
        trace!(barrier = %self.barrier, node = %id, "deferred created");
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Records `parent` as an input of `child` and `child` as a consumer of
    /// `parent`, enforcing single ownership of non-shared nodes. If the
    /// parent has already settled, its outcome is delivered immediately.
    pub fn link(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(child).parents.push(parent);

        let parent_node = self.node_mut(parent);
        if parent_node.shared {
            match &mut parent_node.children {
                Children::Shared(list) => list.push(child),
                other => *other = Children::Shared(vec![child]),
            }
        } else {
            match parent_node.children {
                Children::None => parent_node.children = Children::One(child),
                _ => misuse(
                    ErrorKind::Ownership,
                    format!("deferred {parent} already has a consumer"),
                ),
            }
        }

        if parent_node.is_terminal() {
            self.deliver_from(parent, Some(child));
        }
    }

    /// Final transition of a node. Ignored if the node already settled.
    pub fn finish(&mut self, id: NodeId, settlement: Settlement, state: NodeState) {
        debug_assert!(state.is_terminal(), "finish requires a terminal state");
        let node = self.node_mut(id);
        if node.is_terminal() {
            return;
        }
        node.state = state;
        node.outcome = Some(settlement);
        trace!(barrier = %self.barrier, node = %id, %state, "deferred settled");
        self.reactor.release_node(id);
        self.deliver_from(id, None);
    }

    /// Enqueues the settlement of `id` for its consumers (or just for `only`,
    /// on late adoption). Exclusive consumers take the payload by move;
    /// shared nodes multicast clones and keep their outcome.
    fn deliver_from(&mut self, id: NodeId, only: Option<NodeId>) {
        let node = self.node_mut(id);
        match node.children.clone() {
            Children::None => {}
            Children::One(child) => {
                if let Some(settlement) = node.outcome.take() {
                    self.ready.push_back(Delivery {
                        child,
                        parent: id,
                        settlement,
                    });
                }
            }
            Children::Shared(children) => {
                let Some(settlement) = node.outcome.clone() else {
                    return;
                };
                let targets: Vec<NodeId> = match only {
                    Some(single) => vec![single],
                    None => children,
                };
                for child in targets {
                    self.ready.push_back(Delivery {
                        child,
                        parent: id,
                        settlement: settlement.clone(),
                    });
                }
            }
        }
    }

    /// Marks everything upstream of `from` as live and queues unstarted
    /// producers. Reachability only ever grows; nodes outside it are lazy
    /// orphans collected at barrier teardown.
    pub fn mark_reachable(&mut self, from: NodeId) {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let node = self.node_mut(id);
            if node.reachable {
                continue;
            }
            node.reachable = true;
            if !node.started
                && node.state == NodeState::Pending
                && matches!(node.reaction, Reaction::Source(_))
            {
                self.pending_start.push_back(id);
            }
            // Reversed so the LIFO walk visits parents in index order, which
            // keeps producer start order deterministic.
            let node = self.node(id);
            stack.extend(node.parents.iter().rev().copied());
        }
    }
}
