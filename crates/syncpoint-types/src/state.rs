use std::fmt;

/// Lifecycle state of a deferred node.
///
/// Only three states are terminal. A node enters a terminal state at most
/// once; later transition attempts are ignored by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not yet driven by the event loop.
    Pending,
    /// Producer started, or a callback for this node is in flight.
    Running,
    /// Terminal: settled with a result.
    Fulfilled,
    /// Terminal: settled with a failure.
    Rejected,
    /// Terminal: settled by the cancellation engine.
    Cancelled,
}

impl NodeState {
    /// Whether the node has settled and can no longer transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Rejected | Self::Cancelled)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Fulfilled => write!(f, "fulfilled"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
