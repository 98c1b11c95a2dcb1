use std::io;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use syncpoint_engine::{Deferred, Source, SourceCtx, from_source};
use syncpoint_types::{ErrorKind, Failure};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of named worker threads consuming a shared job channel.
///
/// Submitted tasks run off the loop thread and marshal their settlement back
/// through the barrier's wakeup channel, so the pool never touches engine
/// state directly. Dropping the pool closes the channel and lets workers
/// finish their current job; [`WorkerPool::shutdown`] additionally joins them.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("syncpoint-worker-{index}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let Ok(guard) = rx.lock() else { break };
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                })?;
            workers.push(handle);
        }
        debug!(size, "worker pool started");
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Hands `task` to a worker thread. The returned deferred settles with
    /// the task's result; a panicking task rejects with a `user` failure.
    ///
    /// Cancelling the deferred does not preempt a task already running; its
    /// late settlement is discarded by the loop.
    pub fn submit<R, F>(&self, task: F) -> Deferred<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, Failure> + Send + 'static,
    {
        from_source(WorkerCall {
            tx: self.tx.clone(),
            task: Some(task),
            _result: PhantomData,
        })
    }

    /// Closes the job channel and joins every worker. Queued jobs run first.
    pub fn shutdown(mut self) {
        self.tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

struct WorkerCall<R, F> {
    tx: Option<Sender<Job>>,
    task: Option<F>,
    _result: PhantomData<fn() -> R>,
}

impl<R, F> Source for WorkerCall<R, F>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, Failure> + Send + 'static,
{
    fn start(&mut self, ctx: &mut SourceCtx<'_>) {
        let Some(task) = self.task.take() else {
            return;
        };
        let Some(tx) = self.tx.as_ref() else {
            ctx.reject(Failure::new(ErrorKind::User, "worker pool is shut down"));
            return;
        };
        let wake = ctx.wake_handle();
        let job: Job = Box::new(move || match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(value)) => wake.fulfil(value),
            Ok(Err(failure)) => wake.reject(failure),
            Err(payload) => wake.reject(Failure::from_panic(payload)),
        });
        if tx.send(job).is_err() {
            ctx.reject(Failure::new(ErrorKind::User, "worker pool is shut down"));
        }
    }
}
