//! Single-threaded cooperative deferred-value engine.
//!
//! A deferred is a placeholder for a result produced later by a timer, an
//! external process, a worker thread, or any custom [`Source`]. Programs are
//! written in synchronous style: [`synchronise`] opens a barrier, evaluates
//! an expression that builds a DAG of deferreds, and drives a dedicated event
//! loop until the root settles, returning its value or failure.
//!
//! Construction is lazy: a producer only starts once its node is reachable
//! from the barrier root. Settlement flows parents-to-children through a FIFO
//! ready queue; cancellation flows children-to-parents and stops at shared
//! nodes until teardown. Everything runs on the barrier's thread; the only
//! cross-thread entry is the wakeup channel behind [`WakeHandle`].

mod barrier;
mod cancel;
mod combinators;
mod frame;
mod handle;
mod node;
mod reactor;
mod sched;
mod source;

pub use barrier::{InterruptHandle, interrupt_handle, synchronise};
pub use combinators::{constant, delay, failed, from_source, when_all, when_any, when_some};
pub use handle::{Deferred, SharedDeferred, Step};
pub use reactor::WakeHandle;
pub use source::{
    Firing, Interest, IoToken, Source, SourceCtx, TimerToken, WaitToken, WakeToken,
};
pub use syncpoint_types::{BarrierId, ErrorKind, Failure, NodeId, NodeState};
