use std::fmt;

/// Identifies one synchronisation barrier within the process.
///
/// Allocated from a process-wide counter when the barrier frame is pushed.
/// Deferred handles carry the id of the barrier they were created in so that
/// use from a different barrier is detected immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BarrierId(u64);

impl BarrierId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Index of a deferred node in its barrier's arena.
///
/// Stable for the lifetime of the barrier. Meaningful only together with the
/// owning [`BarrierId`]; two barriers reuse the same index space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}
