//! Fixed-size pools of OS threads pulling jobs from one FIFO queue.
//!
//! Submitting never blocks. A job that errors or panics is logged and the
//! worker moves on to the next one.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, warn};

/// Cloneable handle that enqueues into a pool.
pub struct Submitter<J> {
    tx: Sender<J>,
}

impl<J> Clone for Submitter<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<J> Submitter<J> {
    /// Enqueue `job`. Returns `false` if the queue is closed.
    pub fn submit(&self, job: J) -> bool {
        self.tx.send(job).is_ok()
    }

    /// Enqueue `job`, handing it back if the queue is closed.
    pub fn try_submit(&self, job: J) -> Result<(), J> {
        self.tx.send(job).map_err(|err| err.into_inner())
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

/// Receiving end of a queue created with [`queue`], not yet served by workers.
pub struct Intake<J> {
    tx: Sender<J>,
    rx: Receiver<J>,
}

/// Unbounded FIFO queue. Jobs submitted before a pool starts serving the
/// intake wait for it.
pub fn queue<J>() -> (Submitter<J>, Intake<J>) {
    let (tx, rx) = unbounded();
    (Submitter { tx: tx.clone() }, Intake { tx, rx })
}

pub struct WorkerPool<J> {
    name: String,
    submitter: Submitter<J>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Start `threads` workers (at least one) named `<name>-<i>` on a new queue.
    pub fn spawn<F>(name: &str, threads: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(J) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (_, intake) = queue();
        Self::serve(name, threads, intake, handler)
    }

    /// Start workers on an existing queue.
    pub fn serve<F>(name: &str, threads: usize, intake: Intake<J>, handler: F) -> io::Result<Self>
    where
        F: Fn(J) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let Intake { tx, rx } = intake;
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let handler = Arc::clone(&handler);
            let thread_name = format!("{name}-{i}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, rx, &*handler))?;
            workers.push(handle);
        }
        debug!(pool = name, threads = workers.len(), "worker pool started");
        Ok(Self {
            name: name.to_string(),
            submitter: Submitter { tx },
            workers,
        })
    }

    pub fn submit(&self, job: J) -> bool {
        self.submitter.submit(job)
    }

    pub fn submitter(&self) -> Submitter<J> {
        self.submitter.clone()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn queued(&self) -> usize {
        self.submitter.queued()
    }

    /// Close the queue and wait for the workers to drain it.
    ///
    /// Workers only exit once every [`Submitter`] clone is dropped as well, so
    /// drop the handles given out by [`queue`] and [`Self::submitter`] first.
    pub fn shutdown(self) {
        let Self {
            name,
            submitter,
            workers,
        } = self;
        drop(submitter);
        for handle in workers {
            if handle.join().is_err() {
                error!(pool = %name, "worker thread panicked outside a job");
            }
        }
        debug!(pool = %name, "worker pool stopped");
    }
}

fn worker_loop<J, F>(thread_name: &str, rx: Receiver<J>, handler: &F)
where
    F: Fn(J) -> anyhow::Result<()>,
{
    while let Ok(job) = rx.recv() {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(job))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(worker = thread_name, "job failed: {err:#}"),
            Err(payload) => error!(
                worker = thread_name,
                "job panicked: {}",
                panic_message(payload.as_ref())
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
