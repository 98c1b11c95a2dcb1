use std::fmt;
use std::marker::PhantomData;

use syncpoint_types::{BarrierId, ErrorKind, Failure, NodeId};

use crate::combinators;

/// Typed handle to one deferred value.
///
/// The handle is a cheap copyable key into the owning barrier's arena; it
/// carries no value. A non-shared deferred has at most one consumer: the
/// second combinator applied to copies of the same handle panics with an
/// `ownership` violation. Using a handle inside a different barrier panics
/// with a `cross-barrier` violation.
pub struct Deferred<T> {
    barrier: BarrierId,
    node: NodeId,
    _result: PhantomData<fn() -> T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Deferred<T> {}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deferred({}.{})", self.barrier, self.node)
    }
}

impl<T: 'static> Deferred<T> {
    pub(crate) fn from_parts(barrier: BarrierId, node: NodeId) -> Self {
        Self {
            barrier,
            node,
            _result: PhantomData,
        }
    }

    pub(crate) fn barrier(&self) -> BarrierId {
        self.barrier
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    /// Chains a callback onto fulfilment. The callback may return a plain
    /// value, another deferred (absorbed at any depth), or an explicit
    /// [`Step`]. Rejections flow past it unmodified.
    pub fn then<U, S>(self, on_fulfil: impl FnOnce(T) -> S + 'static) -> Deferred<U>
    where
        U: 'static,
        S: Into<Step<U>>,
    {
        combinators::then(self, on_fulfil)
    }

    /// Chains a callback onto rejection of any kind. Fulfilments flow past
    /// it unmodified.
    pub fn catch<S>(self, on_reject: impl FnOnce(Failure) -> S + 'static) -> Deferred<T>
    where
        S: Into<Step<T>>,
    {
        combinators::catch(self, None, on_reject)
    }

    /// Like [`Self::catch`], but only failures whose kind appears in `kinds`
    /// are handled; everything else passes through.
    pub fn catch_kinds<S>(
        self,
        kinds: &[ErrorKind],
        on_reject: impl FnOnce(Failure) -> S + 'static,
    ) -> Deferred<T>
    where
        S: Into<Step<T>>,
    {
        combinators::catch(self, Some(kinds.to_vec()), on_reject)
    }

    /// Runs a callback after settlement either way. The parent outcome stands
    /// unless the callback fails or returns a deferred that rejects.
    pub fn finally<S>(self, on_final: impl FnOnce() -> S + 'static) -> Deferred<T>
    where
        S: Into<Step<()>>,
    {
        combinators::finally(self, on_final)
    }

    /// Opts this node into multi-consumer use. A shared deferred multicasts
    /// its single settlement to every subscriber and is exempt from
    /// auto-cancellation until barrier teardown.
    pub fn share(self) -> SharedDeferred<T> {
        combinators::share(self)
    }
}

/// Handle to a deferred marked with [`Deferred::share`].
pub struct SharedDeferred<T> {
    barrier: BarrierId,
    node: NodeId,
    _result: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedDeferred<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedDeferred<T> {}

impl<T> fmt::Debug for SharedDeferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedDeferred({}.{})", self.barrier, self.node)
    }
}

impl<T> SharedDeferred<T> {
    pub(crate) fn from_parts(barrier: BarrierId, node: NodeId) -> Self {
        Self {
            barrier,
            node,
            _result: PhantomData,
        }
    }

    pub(crate) fn barrier(&self) -> BarrierId {
        self.barrier
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }
}

impl<T: Clone + 'static> SharedDeferred<T> {
    /// A fresh single-consumer deferred fed a clone of this node's
    /// settlement. Subscribers attach in call order and each sees the same
    /// payload; subscribing after settlement delivers immediately.
    pub fn subscribe(&self) -> Deferred<T> {
        combinators::subscribe(self)
    }

    /// Shorthand for `subscribe().then(..)`.
    pub fn then<U, S>(&self, on_fulfil: impl FnOnce(T) -> S + 'static) -> Deferred<U>
    where
        U: 'static,
        S: Into<Step<U>>,
    {
        self.subscribe().then(on_fulfil)
    }

    /// Shorthand for `subscribe().catch(..)`.
    pub fn catch<S>(&self, on_reject: impl FnOnce(Failure) -> S + 'static) -> Deferred<T>
    where
        S: Into<Step<T>>,
    {
        self.subscribe().catch(on_reject)
    }

    /// Shorthand for `subscribe().finally(..)`.
    pub fn finally<S>(&self, on_final: impl FnOnce() -> S + 'static) -> Deferred<T>
    where
        S: Into<Step<()>>,
    {
        self.subscribe().finally(on_final)
    }
}

/// What a combinator callback produced.
///
/// Callbacks usually return a plain value or a `Deferred` and rely on the
/// `From` conversions; `Step::fail` is the explicit rejection path.
pub enum Step<T> {
    /// Settle with this value now.
    Now(T),
    /// Absorb: settle with whatever this deferred settles with.
    Wait(Deferred<T>),
    /// Reject with this failure.
    Fail(Failure),
}

impl<T> Step<T> {
    pub fn now(value: T) -> Self {
        Self::Now(value)
    }

    pub fn wait(deferred: Deferred<T>) -> Self {
        Self::Wait(deferred)
    }

    pub fn fail(failure: Failure) -> Self {
        Self::Fail(failure)
    }
}

impl<T> From<T> for Step<T> {
    fn from(value: T) -> Self {
        Self::Now(value)
    }
}

impl<T> From<Deferred<T>> for Step<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Self::Wait(deferred)
    }
}
