use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use polling::Event;
use syncpoint_types::{Failure, NodeId};

use crate::node::Settlement;
use crate::reactor::{Reactor, WakeHandle};

/// Handle for a registered timer deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerToken(pub(crate) usize);

/// Handle for a registered fd watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoToken(pub(crate) usize);

/// Handle for a registered process-exit watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitToken(pub(crate) usize);

/// Handle for a cross-thread wakeup slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeToken(pub(crate) usize);

/// Readiness interest for an fd watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    pub(crate) fn event(self, key: usize) -> Event {
        match self {
            Self::Readable => Event::readable(key),
            Self::Writable => Event::writable(key),
            Self::ReadWrite => Event::all(key),
        }
    }
}

/// A readiness event delivered to the source that registered it.
#[derive(Clone, Copy, Debug)]
pub enum Firing {
    Timer(TimerToken),
    Io {
        token: IoToken,
        readable: bool,
        writable: bool,
    },
    /// The watched process has exited (the exit status is not reaped here;
    /// the adapter collects it).
    ProcessExit(WaitToken),
}

/// The contract every async source satisfies to plug into the engine.
///
/// All three methods run on the loop thread. A source settles its node by
/// calling [`SourceCtx::fulfil`] or [`SourceCtx::reject`] exactly once; any
/// later call is ignored. After `abort` returns, settlements from this source
/// are discarded, including thread-marshalled ones already in flight.
pub trait Source {
    /// Begin work. Register deadlines, fds, or process ids through `ctx`, or
    /// settle immediately for synchronous sources.
    fn start(&mut self, ctx: &mut SourceCtx<'_>);

    /// One of this source's registrations became ready.
    fn on_ready(&mut self, firing: Firing, ctx: &mut SourceCtx<'_>) {
        let _ = (firing, ctx);
    }

    /// Idempotent request to stop early and release resources.
    fn abort(&mut self, ctx: &mut SourceCtx<'_>) {
        let _ = ctx;
    }
}

/// Loop-side context handed to a source while one of its methods runs.
///
/// Wraps the registration surface of the reactor, binding every registration
/// to the source's node, and collects at most one settlement.
pub struct SourceCtx<'a> {
    pub(crate) node: NodeId,
    pub(crate) reactor: &'a mut Reactor,
    pub(crate) settled: &'a mut Option<Settlement>,
}

impl SourceCtx<'_> {
    /// Settles the node with a result. First settlement wins.
    pub fn fulfil<T: 'static>(&mut self, value: T) {
        self.settle(Ok(Rc::new(value)));
    }

    /// Settles the node with a failure. First settlement wins.
    pub fn reject(&mut self, failure: Failure) {
        self.settle(Err(failure));
    }

    pub(crate) fn settle(&mut self, settlement: Settlement) {
        if self.settled.is_none() {
            *self.settled = Some(settlement);
        }
    }

    pub fn register_timer(&mut self, deadline: Instant) -> TimerToken {
        self.reactor.register_timer(self.node, deadline)
    }

    pub fn cancel_timer(&mut self, token: TimerToken) {
        self.reactor.cancel_timer(token);
    }

    pub fn register_io(&mut self, fd: RawFd, interest: Interest) -> io::Result<IoToken> {
        self.reactor.register_io(self.node, fd, interest)
    }

    pub fn cancel_io(&mut self, token: IoToken) {
        self.reactor.cancel_io(token);
    }

    pub fn register_wait(&mut self, pid: u32) -> io::Result<WaitToken> {
        self.reactor.register_wait(self.node, pid)
    }

    pub fn cancel_wait(&mut self, token: WaitToken) {
        self.reactor.cancel_wait(token);
    }

    /// A sendable handle through which another thread settles this node.
    /// The only cross-thread entry; everything else here is loop-confined.
    pub fn wake_handle(&mut self) -> WakeHandle {
        self.reactor.wake_handle(self.node)
    }
}

/// Source for `constant` and `failed`: settles the moment it is started,
/// which still only happens once the node is reachable from the root.
pub(crate) struct ImmediateSource {
    pub outcome: Option<Settlement>,
}

impl Source for ImmediateSource {
    fn start(&mut self, ctx: &mut SourceCtx<'_>) {
        if let Some(outcome) = self.outcome.take() {
            ctx.settle(outcome);
        }
    }
}

/// Source for `delay`: one timer registration, fulfils with `()`.
pub(crate) struct TimerSource {
    pub after: Duration,
    pub token: Option<TimerToken>,
}

impl Source for TimerSource {
    fn start(&mut self, ctx: &mut SourceCtx<'_>) {
        self.token = Some(ctx.register_timer(Instant::now() + self.after));
    }

    fn on_ready(&mut self, firing: Firing, ctx: &mut SourceCtx<'_>) {
        if let Firing::Timer(fired) = firing
            && self.token == Some(fired)
        {
            ctx.fulfil(());
        }
    }

    fn abort(&mut self, ctx: &mut SourceCtx<'_>) {
        if let Some(token) = self.token.take() {
            ctx.cancel_timer(token);
        }
    }
}
