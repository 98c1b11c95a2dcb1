use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use polling::Poller;
use syncpoint_types::{BarrierId, ErrorKind, Failure, NodeId};
use tracing::debug;

use crate::cancel::{CancelScope, cancel_set};
use crate::combinators::take_payload;
use crate::frame::{self, Frame};
use crate::handle::Deferred;
use crate::sched::{dispatch, next_user_job, perform, start_pending};

/// Pops the barrier frame even when `expr`, a callback, or the loop panics.
struct FrameGuard {
    barrier: BarrierId,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        frame::pop_frame(self.barrier);
    }
}

/// Requests cancellation of a running barrier from outside its loop.
///
/// Safe to trigger from any thread or from a signal handler context that can
/// run arbitrary code. Idempotent; once the root is already settled the
/// request has no effect.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    poller: Arc<Poller>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
        let _ = self.poller.notify();
    }
}

/// An interrupt handle bound to the innermost active barrier.
///
/// Taking a handle disables that barrier's stall detection, since an
/// interrupt may now arrive at any time.
pub fn interrupt_handle() -> InterruptHandle {
    frame::with_frame(|frame| {
        frame.interrupt_taken = true;
        InterruptHandle {
            flag: Arc::clone(&frame.interrupt_flag),
            poller: frame.reactor.poller(),
        }
    })
}

/// Opens a synchronisation barrier, evaluates `expr` to obtain the root
/// deferred, and drives the event loop until the root settles.
///
/// `expr` runs with the new barrier already active; it may only construct
/// deferreds. Barriers nest: a callback may call `synchronise` again, and the
/// outer loop stays suspended until the inner barrier returns. On the way out
/// every deferred still live in this barrier is cancelled and its producer
/// aborted, shared nodes included.
pub fn synchronise<T: 'static>(expr: impl FnOnce() -> Deferred<T>) -> Result<T, Failure> {
    let frame_rc = frame::push_frame().map_err(|err| {
        Failure::new(
            ErrorKind::Interrupted,
            format!("failed to set up the event loop: {err}"),
        )
    })?;
    let barrier = frame_rc.borrow().barrier;
    let guard = FrameGuard { barrier };
    debug!(%barrier, "synchronisation barrier opened");

    let root = expr();
    {
        let mut frame = frame_rc.borrow_mut();
        frame.check_barrier(root.barrier(), root.node());
        frame.root = Some(root.node());
        frame.mark_reachable(root.node());
    }

    let run_result = run(&frame_rc, root.node());
    teardown(&frame_rc);
    drop(guard);
    debug!(%barrier, "synchronisation barrier closed");

    run_result?;

    let mut frame = frame_rc.borrow_mut();
    let interrupted = frame.interrupt_flag.load(Ordering::Relaxed);
    match frame.node_mut(root.node()).outcome.take() {
        Some(Ok(payload)) => Ok(take_payload::<T>(payload)),
        Some(Err(failure)) if interrupted => Err(Failure::new(
            ErrorKind::Interrupted,
            "synchronisation barrier interrupted",
        )
        .caused_by(failure)),
        Some(Err(failure)) => Err(failure),
        None => Err(Failure::new(
            ErrorKind::Interrupted,
            "the root deferred never settled",
        )),
    }
}

enum NextStep {
    Done,
    CancelRoot,
    Stalled,
    Block(Option<Instant>),
}

/// One event-loop: drain the ready queue, then block on the reactor until
/// something fires, until the root settles.
fn run(frame_rc: &Rc<RefCell<Frame>>, root: NodeId) -> Result<(), Failure> {
    loop {
        drain(frame_rc);

        let step = {
            let mut frame = frame_rc.borrow_mut();
            let root_terminal = frame.node(root).is_terminal();
            if frame.interrupt_flag.load(Ordering::Relaxed) && !root_terminal {
                NextStep::CancelRoot
            } else if root_terminal && frame.ready.is_empty() {
                NextStep::Done
            } else if frame.reactor.is_idle() && !frame.interrupt_taken {
                NextStep::Stalled
            } else {
                NextStep::Block(frame.reactor.next_deadline())
            }
        };

        match step {
            NextStep::Done => return Ok(()),
            NextStep::CancelRoot => {
                let mut frame = frame_rc.borrow_mut();
                cancel_set(
                    &mut frame,
                    vec![root],
                    "synchronisation barrier interrupted",
                    CancelScope::Auto,
                );
            }
            NextStep::Stalled => panic!(
                "synchronisation barrier stalled: the root deferred can no longer settle \
                 (no timers, watches, or pending wakeups)"
            ),
            NextStep::Block(deadline) => {
                let mut frame = frame_rc.borrow_mut();
                let fired = frame.reactor.wait(deadline).map_err(|err| {
                    Failure::new(
                        ErrorKind::Interrupted,
                        format!("event poller failed: {err}"),
                    )
                })?;
                dispatch(&mut frame, fired);
            }
        }
    }
}

/// Runs ready callbacks and starts newly reachable producers until both
/// queues are quiet. User callbacks execute with no frame borrow held.
fn drain(frame_rc: &Rc<RefCell<Frame>>) {
    loop {
        let job = {
            let mut frame = frame_rc.borrow_mut();
            start_pending(&mut frame);
            next_user_job(&mut frame)
        };
        match job {
            Some(job) => perform(frame_rc, job),
            None => {
                if frame_rc.borrow().pending_start.is_empty() {
                    break;
                }
            }
        }
    }
}

/// Cancels everything still live in the barrier before the frame is
/// released.
///
/// Cancellation is seeded at producers (and parentless strays) rather than
/// swept over every node, so the resulting settlements flow downstream
/// through combinator chains: `catch` observers run with the `cancelled`
/// failure before `synchronise` returns. Nodes created by observer callbacks
/// during teardown are swept in the next round; anything a round cannot
/// reach through deliveries is cancelled outright so teardown terminates.
fn teardown(frame_rc: &Rc<RefCell<Frame>>) {
    loop {
        loop {
            let job = { next_user_job(&mut frame_rc.borrow_mut()) };
            match job {
                Some(job) => perform(frame_rc, job),
                None => break,
            }
        }

        let (seeds, leftovers) = {
            let frame = frame_rc.borrow();
            let mut seeds = Vec::new();
            let mut leftovers = Vec::new();
            for (key, node) in frame.nodes.iter() {
                if node.is_terminal() {
                    continue;
                }
                let id = NodeId::from_index(key);
                if matches!(node.reaction, crate::node::Reaction::Source(_))
                    || node.parents.is_empty()
                {
                    seeds.push(id);
                } else {
                    leftovers.push(id);
                }
            }
            (seeds, leftovers)
        };

        if seeds.is_empty() && leftovers.is_empty() {
            break;
        }
        let batch = if seeds.is_empty() { leftovers } else { seeds };
        let mut frame = frame_rc.borrow_mut();
        cancel_set(
            &mut frame,
            batch,
            "synchronisation barrier teardown",
            CancelScope::Teardown,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;
    use crate::combinators::{constant, delay, from_source, when_any};
    use crate::handle::Step;
    use crate::source::{Firing, Interest, Source, SourceCtx};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Source that counts starts and aborts and never settles on its own.
    struct Hang {
        started: Rc<Cell<u32>>,
        aborted: Rc<Cell<u32>>,
    }

    impl Source for Hang {
        fn start(&mut self, _ctx: &mut SourceCtx<'_>) {
            self.started.set(self.started.get() + 1);
        }

        fn abort(&mut self, _ctx: &mut SourceCtx<'_>) {
            self.aborted.set(self.aborted.get() + 1);
        }
    }

    #[test_log::test]
    fn a_delayed_then_chain_returns_through_the_barrier() {
        let result = synchronise(|| delay(ms(50)).then(|_| 42));
        assert_eq!(result, Ok(42));
    }

    #[test_log::test]
    fn nested_barriers_complete_before_the_outer_callback_resumes() {
        let result = synchronise(|| {
            delay(ms(5)).then(|_| {
                let inner = synchronise(|| delay(ms(5)).then(|_| 'x'));
                inner.expect("inner barrier")
            })
        });
        assert_eq!(result, Ok('x'));
    }

    #[test]
    fn leaking_a_deferred_into_another_barrier_is_rejected() {
        let err = synchronise(|| {
            let outer = constant(5);
            let leak = outer;
            outer.then(move |_: i32| {
                let _ = synchronise(move || leak.then(|v: i32| v));
                0
            })
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert!(err.message.contains("cross-barrier violation"));
    }

    #[test]
    fn siblings_still_pending_are_aborted_before_the_barrier_returns() {
        let started = Rc::new(Cell::new(0));
        let aborted = Rc::new(Cell::new(0));
        let started_in = Rc::clone(&started);
        let aborted_in = Rc::clone(&aborted);

        let result = synchronise(|| {
            let shared = delay(ms(5)).share();
            let _side: Deferred<()> = shared.then(move |_| {
                from_source::<()>(Hang {
                    started: started_in,
                    aborted: aborted_in,
                })
            });
            shared.then(|_| 1)
        });

        assert_eq!(result, Ok(1));
        assert_eq!(started.get(), 1);
        assert_eq!(aborted.get(), 1);
    }

    #[test]
    fn interrupting_from_another_thread_cancels_the_root() {
        let result = synchronise(|| {
            let handle = interrupt_handle();
            std::thread::spawn(move || {
                std::thread::sleep(ms(20));
                handle.interrupt();
            });
            delay(Duration::from_secs(30))
        });

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interrupted);
        assert_eq!(err.causes.len(), 1);
        assert_eq!(err.causes[0].kind, ErrorKind::Cancelled);
    }

    #[test]
    #[should_panic(expected = "stalled")]
    fn a_barrier_that_cannot_progress_panics() {
        struct Never;
        impl Source for Never {
            fn start(&mut self, _ctx: &mut SourceCtx<'_>) {}
        }
        let _ = synchronise(|| from_source::<()>(Never));
    }

    #[test]
    fn timeouts_are_expressed_with_when_any_and_rewriting() {
        enum Outcome {
            Done(u32),
            TimedOut,
        }

        let err = synchronise(|| {
            let op = delay(ms(200)).then(|_| Outcome::Done(1));
            let deadline = delay(ms(10)).then(|_| Outcome::TimedOut);
            when_any(vec![op, deadline]).then::<u32, _>(|outcome| match outcome {
                Outcome::Done(v) => Step::now(v),
                Outcome::TimedOut => Step::fail(Failure::timeout("operation timed out")),
            })
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test_log::test]
    fn io_readiness_drives_a_custom_source() {
        struct PipeRead {
            stream: UnixStream,
            buf: Vec<u8>,
        }

        impl Source for PipeRead {
            fn start(&mut self, ctx: &mut SourceCtx<'_>) {
                if let Err(err) = self.stream.set_nonblocking(true) {
                    ctx.reject(Failure::new(ErrorKind::User, err.to_string()));
                    return;
                }
                if let Err(err) = ctx.register_io(self.stream.as_raw_fd(), Interest::Readable) {
                    ctx.reject(Failure::new(ErrorKind::User, err.to_string()));
                }
            }

            fn on_ready(&mut self, firing: Firing, ctx: &mut SourceCtx<'_>) {
                let Firing::Io { .. } = firing else { return };
                let mut chunk = [0_u8; 64];
                loop {
                    match self.stream.read(&mut chunk) {
                        Ok(0) => {
                            ctx.fulfil(std::mem::take(&mut self.buf));
                            return;
                        }
                        Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                        Err(err) => {
                            ctx.reject(Failure::new(ErrorKind::User, err.to_string()));
                            return;
                        }
                    }
                }
            }
        }

        let (reader, mut writer) = UnixStream::pair().expect("socket pair");
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(ms(15));
            writer.write_all(b"ping").expect("write side");
        });

        let result = synchronise(|| {
            from_source::<Vec<u8>>(PipeRead {
                stream: reader,
                buf: Vec::new(),
            })
        });
        feeder.join().expect("feeder thread");
        assert_eq!(result, Ok(b"ping".to_vec()));
    }
}
