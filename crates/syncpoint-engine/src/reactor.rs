use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Instant;

use polling::{Event, Events, Poller};
use slab::Slab;
use syncpoint_types::{Failure, NodeId};
use tracing::trace;

use crate::source::{Firing, Interest, IoToken, TimerToken, WaitToken, WakeToken};

/// A settlement marshalled in from another thread.
struct WakeMsg {
    token: WakeToken,
    outcome: Result<Box<dyn Any + Send>, Failure>,
}

/// An event the loop must act on after blocking.
pub(crate) enum Fired {
    /// A registration owned by a source adapter became ready.
    Source { node: NodeId, firing: Firing },
    /// A thread-marshalled settlement for the node owning the wake token.
    Wake {
        node: NodeId,
        outcome: Result<Box<dyn Any + Send>, Failure>,
    },
}

/// The only cross-thread entry into a barrier's event loop.
///
/// Clone freely and move to worker threads or signal contexts. The first
/// settlement delivered for the handle's token wins; later ones, and any
/// settlement for a token the loop has already released (late events from an
/// aborted producer), are discarded.
#[derive(Clone)]
pub struct WakeHandle {
    token: WakeToken,
    tx: Sender<WakeMsg>,
    poller: Arc<Poller>,
}

impl WakeHandle {
    /// Fulfils the owning node with `value`.
    pub fn fulfil<T: Send + 'static>(&self, value: T) {
        self.send(Ok(Box::new(value)));
    }

    /// Rejects the owning node with `failure`.
    pub fn reject(&self, failure: Failure) {
        self.send(Err(failure));
    }

    fn send(&self, outcome: Result<Box<dyn Any + Send>, Failure>) {
        // Both calls may fail once the barrier is gone; the settlement is
        // then moot and silently dropped.
        let _ = self.tx.send(WakeMsg {
            token: self.token,
            outcome,
        });
        let _ = self.poller.notify();
    }
}

/// An fd or pidfd watched by the poller. Slab key doubles as poller key.
enum Watch {
    Io {
        fd: RawFd,
        node: NodeId,
        interest: Interest,
    },
    Wait {
        pidfd: OwnedFd,
        node: NodeId,
    },
}

impl Watch {
    fn node(&self) -> NodeId {
        match self {
            Self::Io { node, .. } | Self::Wait { node, .. } => *node,
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    at: Instant,
    seq: u64,
    token: usize,
}

/// Per-barrier readiness substrate: timer heap, fd/pidfd poller, and the
/// loop-owned wakeup channel.
///
/// Timer and wake cancellation is lazy: the token table is the source of
/// truth, and heap entries or channel messages whose token is gone are
/// discarded when encountered.
pub(crate) struct Reactor {
    poller: Arc<Poller>,
    events: Events,
    watches: Slab<Watch>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_targets: Slab<NodeId>,
    timer_seq: u64,
    wake_targets: Slab<NodeId>,
    wake_tx: Sender<WakeMsg>,
    wake_rx: Receiver<WakeMsg>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let (wake_tx, wake_rx) = channel();
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            events: Events::new(),
            watches: Slab::new(),
            timers: BinaryHeap::new(),
            timer_targets: Slab::new(),
            timer_seq: 0,
            wake_targets: Slab::new(),
            wake_tx,
            wake_rx,
        })
    }

    /// Shared handle to the poller, for out-of-loop notification (interrupt
    /// handles and wake handles).
    pub fn poller(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    pub fn register_timer(&mut self, node: NodeId, deadline: Instant) -> TimerToken {
        let token = self.timer_targets.insert(node);
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            at: deadline,
            seq: self.timer_seq,
            token,
        }));
        TimerToken(token)
    }

    pub fn cancel_timer(&mut self, token: TimerToken) {
        self.timer_targets.try_remove(token.0);
    }

    pub fn register_io(&mut self, node: NodeId, fd: RawFd, interest: Interest) -> io::Result<IoToken> {
        let entry = self.watches.vacant_entry();
        let key = entry.key();
        unsafe { self.poller.add(fd, interest.event(key))? };
        entry.insert(Watch::Io { fd, node, interest });
        Ok(IoToken(key))
    }

    pub fn cancel_io(&mut self, token: IoToken) {
        self.remove_watch(token.0);
    }

    pub fn register_wait(&mut self, node: NodeId, pid: u32) -> io::Result<WaitToken> {
        let pidfd = open_pidfd(pid)?;
        let entry = self.watches.vacant_entry();
        let key = entry.key();
        unsafe { self.poller.add(pidfd.as_raw_fd(), Event::readable(key))? };
        entry.insert(Watch::Wait { pidfd, node });
        Ok(WaitToken(key))
    }

    pub fn cancel_wait(&mut self, token: WaitToken) {
        self.remove_watch(token.0);
    }

    pub fn wake_handle(&mut self, node: NodeId) -> WakeHandle {
        let token = WakeToken(self.wake_targets.insert(node));
        WakeHandle {
            token,
            tx: self.wake_tx.clone(),
            poller: Arc::clone(&self.poller),
        }
    }

    /// Oneshot registrations must be re-armed after each delivery; called by
    /// the loop when an io watch survives its readiness callback.
    pub fn rearm_io(&mut self, token: IoToken) {
        if let Some(Watch::Io { fd, interest, .. }) = self.watches.get(token.0) {
            let source = unsafe { BorrowedFd::borrow_raw(*fd) };
            if let Err(err) = self.poller.modify(source, interest.event(token.0)) {
                trace!(token = token.0, %err, "failed to re-arm io watch");
            }
        }
    }

    /// Drops every registration owned by `node`. Called on settlement and on
    /// cancellation so that late events are discarded rather than delivered.
    pub fn release_node(&mut self, node: NodeId) {
        let watch_keys: Vec<usize> = self
            .watches
            .iter()
            .filter(|(_, w)| w.node() == node)
            .map(|(key, _)| key)
            .collect();
        for key in watch_keys {
            self.remove_watch(key);
        }

        let timer_keys: Vec<usize> = self
            .timer_targets
            .iter()
            .filter(|(_, n)| **n == node)
            .map(|(key, _)| key)
            .collect();
        for key in timer_keys {
            self.timer_targets.try_remove(key);
        }

        let wake_keys: Vec<usize> = self
            .wake_targets
            .iter()
            .filter(|(_, n)| **n == node)
            .map(|(key, _)| key)
            .collect();
        for key in wake_keys {
            self.wake_targets.try_remove(key);
        }
    }

    fn remove_watch(&mut self, key: usize) {
        match self.watches.try_remove(key) {
            Some(Watch::Io { fd, .. }) => {
                let source = unsafe { BorrowedFd::borrow_raw(fd) };
                let _ = self.poller.delete(source);
            }
            Some(Watch::Wait { pidfd, .. }) => {
                let _ = self.poller.delete(&pidfd);
            }
            None => {}
        }
    }

    /// Earliest live timer deadline, pruning cancelled heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.timers.peek() {
            if self.timer_targets.contains(entry.token) {
                return Some(entry.at);
            }
            self.timers.pop();
        }
        None
    }

    /// True when nothing registered here can ever fire.
    pub fn is_idle(&mut self) -> bool {
        self.watches.is_empty() && self.wake_targets.is_empty() && self.next_deadline().is_none()
    }

    /// Blocks until a source fires, a wakeup arrives, or `deadline` elapses;
    /// returns the events to act on, in io / wakeup / timer order.
    pub fn wait(&mut self, deadline: Option<Instant>) -> io::Result<Vec<Fired>> {
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let mut fired = Vec::new();
        for event in self.events.iter() {
            match self.watches.get(event.key) {
                Some(Watch::Io { node, .. }) => fired.push(Fired::Source {
                    node: *node,
                    firing: Firing::Io {
                        token: IoToken(event.key),
                        readable: event.readable,
                        writable: event.writable,
                    },
                }),
                Some(Watch::Wait { node, .. }) => fired.push(Fired::Source {
                    node: *node,
                    firing: Firing::ProcessExit(WaitToken(event.key)),
                }),
                // Stale key: the watch was released after the event queued.
                None => {}
            }
        }

        while let Ok(msg) = self.wake_rx.try_recv() {
            // A wake token is single-shot: consumed by the first settlement.
            match self.wake_targets.try_remove(msg.token.0) {
                Some(node) => fired.push(Fired::Wake {
                    node,
                    outcome: msg.outcome,
                }),
                None => trace!(token = msg.token.0, "discarding settlement for released wake token"),
            }
        }

        let now = Instant::now();
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.at > now {
                break;
            }
            let token = entry.token;
            self.timers.pop();
            if let Some(node) = self.timer_targets.try_remove(token) {
                fired.push(Fired::Source {
                    node,
                    firing: Firing::Timer(TimerToken(token)),
                });
            }
        }

        Ok(fired)
    }
}

#[cfg(target_os = "linux")]
fn open_pidfd(pid: u32) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0 as libc::c_uint) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw as RawFd) })
}

#[cfg(not(target_os = "linux"))]
fn open_pidfd(_pid: u32) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-exit readiness requires pidfd support",
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use syncpoint_types::ErrorKind;

    use super::*;

    fn node(tag: usize) -> NodeId {
        NodeId::from_index(tag)
    }

    #[test]
    fn due_timers_fire_in_deadline_then_registration_order() {
        let mut reactor = Reactor::new().expect("reactor");
        let now = Instant::now();
        reactor.register_timer(node(1), now + Duration::from_millis(2));
        reactor.register_timer(node(2), now + Duration::from_millis(1));
        reactor.register_timer(node(3), now + Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(5));
        let fired = reactor.wait(Some(Instant::now())).expect("wait");
        let order: Vec<NodeId> = fired
            .iter()
            .filter_map(|f| match f {
                Fired::Source { node, firing: Firing::Timer(_) } => Some(*node),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![node(2), node(3), node(1)]);
    }

    #[test]
    fn cancelled_timer_never_fires_and_leaves_reactor_idle() {
        let mut reactor = Reactor::new().expect("reactor");
        let token = reactor.register_timer(node(7), Instant::now());
        reactor.cancel_timer(token);

        assert!(reactor.is_idle());
        let fired = reactor.wait(Some(Instant::now())).expect("wait");
        assert!(fired.is_empty());
    }

    #[test]
    fn wake_handle_delivers_once_and_stale_settlements_are_dropped() {
        let mut reactor = Reactor::new().expect("reactor");
        let handle = reactor.wake_handle(node(4));
        handle.fulfil(41_u32);
        handle.reject(Failure::new(ErrorKind::User, "late"));

        let fired = reactor.wait(Some(Instant::now())).expect("wait");
        assert_eq!(fired.len(), 1);
        match &fired[0] {
            Fired::Wake { node: n, outcome: Ok(payload) } => {
                assert_eq!(*n, node(4));
                assert_eq!(payload.downcast_ref::<u32>(), Some(&41));
            }
            _ => panic!("expected a fulfilment wakeup"),
        }
    }

    #[test]
    fn release_node_invalidates_wake_tokens() {
        let mut reactor = Reactor::new().expect("reactor");
        let handle = reactor.wake_handle(node(9));
        reactor.release_node(node(9));
        handle.fulfil(());

        let fired = reactor.wait(Some(Instant::now())).expect("wait");
        assert!(fired.is_empty());
        assert!(reactor.is_idle());
    }
}
