//! Worker pool for asynchronous dispatch.
//!
//! A fixed set of threads, each owning its own FIFO queue. New work goes to
//! the worker with the fewest queued or running calls. Workers never stop on a failing
//! call; the guarded wrapper in [`Bus`] turns failures into
//! [`ProcState::EXCEPTION`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bus::Bus;
use crate::error::BusError;
use crate::receptor::{InstanceRegistration, TypeRegistration};
use crate::semantic::Message;
use crate::types::{MembraneId, ProcState, TypeKey};

/// Which receptor a call targets.
#[derive(Clone)]
pub(crate) enum Target {
    /// Build a fresh receptor for this call and dispose it afterwards.
    Fresh(Arc<TypeRegistration>),
    /// Use the registered instance; the registrant owns its lifetime.
    Shared(Arc<InstanceRegistration>),
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Target::Fresh(registration) => registration.name(),
            Target::Shared(registration) => registration.name(),
        }
    }
}

/// One queued unit of work.
pub(crate) struct ProcessCall {
    pub bus: Bus,
    pub target: Target,
    pub membrane: MembraneId,
    pub key: TypeKey,
    pub message: Message,
    pub done: Option<std_mpsc::Sender<ProcState>>,
}

impl ProcessCall {
    pub fn run(self) -> ProcState {
        let state = self
            .bus
            .execute(&self.target, &self.membrane, self.key, &self.message);
        if let Some(done) = self.done {
            let _ = done.send(state);
        }
        state
    }
}

/// Work a pool worker can run.
pub(crate) trait Job: Send + 'static {
    fn perform(self);
}

impl Job for ProcessCall {
    fn perform(self) {
        self.run();
    }
}

/// Pool-wide count of calls queued or running.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Releases a finished call's worker depth and pending count, including
/// when the call unwinds.
struct PendingGuard {
    depth: Arc<AtomicUsize>,
    pending: Arc<Pending>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.pending.decrement();
    }
}

struct Worker<J> {
    tx: mpsc::UnboundedSender<J>,
    depth: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct WorkerPool<J: Job = ProcessCall> {
    workers: Vec<Worker<J>>,
    pending: Arc<Pending>,
}

impl<J: Job> WorkerPool<J> {
    pub fn new(size: usize, thread_name: &str) -> Result<Self, BusError> {
        debug_assert!(size > 0, "worker pool needs at least one worker");
        let pending = Arc::new(Pending::default());
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            let depth = Arc::new(AtomicUsize::new(0));
            let handle = thread::Builder::new()
                .name(format!("{thread_name}-{index}"))
                .spawn({
                    let depth = Arc::clone(&depth);
                    let pending = Arc::clone(&pending);
                    move || worker_loop(index, rx, depth, pending)
                })
                .map_err(|source| BusError::WorkerSpawn { index, source })?;
            workers.push(Worker {
                tx,
                depth,
                handle: Some(handle),
            });
        }

        debug!(workers = size, "worker pool started");
        Ok(Self { workers, pending })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Calls queued on or running in each worker.
    pub fn depths(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|worker| worker.depth.load(Ordering::SeqCst))
            .collect()
    }

    /// Calls queued or running across the pool.
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    fn least_loaded(&self) -> Option<&Worker<J>> {
        self.workers
            .iter()
            .min_by_key(|worker| worker.depth.load(Ordering::SeqCst))
    }

    /// Queues a call on the least loaded worker. Hands the call back if no
    /// worker can take it.
    pub(crate) fn enqueue(&self, call: J) -> Result<(), J> {
        let Some(worker) = self.least_loaded() else {
            return Err(call);
        };

        worker.depth.fetch_add(1, Ordering::SeqCst);
        self.pending.increment();
        if let Err(mpsc::error::SendError(call)) = worker.tx.send(call) {
            worker.depth.fetch_sub(1, Ordering::SeqCst);
            self.pending.decrement();
            return Err(call);
        }
        Ok(())
    }

    /// Blocks until no call is queued or running, or `timeout` passes.
    /// Returns true if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

fn worker_loop<J: Job>(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<J>,
    depth: Arc<AtomicUsize>,
    pending: Arc<Pending>,
) {
    trace!(worker = index, "worker running");
    while let Some(call) = rx.blocking_recv() {
        let _guard = PendingGuard {
            depth: Arc::clone(&depth),
            pending: Arc::clone(&pending),
        };
        call.perform();
    }
    trace!(worker = index, "worker stopped");
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .drain(..)
            .filter_map(|worker| {
                drop(worker.tx);
                worker.handle
            })
            .collect();

        for handle in handles {
            // The last bus handle can be released by a call running on a worker.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}
