//! Fixed-size FIFO worker pool shared by all bulk BLS work.
//!
//! Units of work are plain closures. Results travel back over a one-shot
//! channel wrapped in [`WorkHandle`]; a handle whose job panicked, was
//! discarded on stop, or was rejected after stop resolves to
//! [`Error::WorkerStopped`].

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::config::WorkerConfig;
use crate::types::Error;

/// Completion callback invoked exactly once with the result of an operation.
pub type Done<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Resolvable handle for an asynchronously computed value.
pub struct WorkHandle<T> {
    rx: Receiver<T>,
}

impl<T> WorkHandle<T> {
    /// Blocks until the value is available.
    pub fn wait(self) -> Result<T, Error> {
        self.rx.recv().map_err(|_| Error::WorkerStopped)
    }

    pub fn try_take(&self) -> Option<Result<T, Error>> {
        match self.rx.try_recv() {
            Ok(v) => Some(Ok(v)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::WorkerStopped)),
        }
    }
}

/// Pairs a completion callback with the handle it resolves.
pub fn completion<T: Send + 'static>() -> (Done<T>, WorkHandle<T>) {
    let (tx, rx) = bounded(1);
    let done: Done<T> = Box::new(move |value| {
        // The receiver may have been dropped by a caller that lost interest.
        let _ = tx.send(value);
    });
    (done, WorkHandle { rx })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// Run everything already queued, including follow-up work it spawns.
    Drain,
    /// Skip every job that has not started yet.
    Discard,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    worker_count: usize,
    stopped: AtomicBool,
    discarding: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> Result<Self, Error> {
        config.validate()?;
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .panic_handler(|payload| {
                error!(reason = %panic_reason(payload.as_ref()), "bls worker job panicked");
            })
            .build()
            .map_err(|e| Error::Config(format!("worker pool: {e}")))?;
        debug!(workers = config.worker_count, "started bls worker pool");
        Ok(Self {
            pool,
            worker_count: config.worker_count,
            stopped: AtomicBool::new(false),
            discarding: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queues a unit of work. Returns false, dropping the job, once the pool
    /// is stopped.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            // While draining, follow-up work from running jobs is still accepted.
            let from_worker = self.pool.current_thread_index().is_some();
            if self.discarding.load(Ordering::Acquire) || !from_worker {
                debug!("rejecting job submitted after stop");
                return false;
            }
        }
        *self.in_flight.count.lock() += 1;
        let guard = InFlightGuard(self.in_flight.clone());
        let discarding = self.discarding.clone();
        self.pool.spawn_fifo(move || {
            let _guard = guard;
            if discarding.load(Ordering::Acquire) {
                return;
            }
            job();
        });
        true
    }

    /// Queues a unit of work and returns a handle to its result.
    pub fn submit<F, R>(&self, job: F) -> WorkHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done, handle) = completion();
        // A rejected job drops `done`, which resolves the handle to an error.
        let _ = self.spawn(move || done(job()));
        handle
    }

    /// Queues a unit of work and blocks until it finishes.
    ///
    /// Must not be called from a pool thread: the caller would occupy the
    /// worker its own job needs.
    pub fn submit_and_wait<F, R>(&self, job: F) -> Result<R, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(job).wait()
    }

    pub fn stop(&self, mode: StopMode) {
        if mode == StopMode::Discard {
            self.discarding.store(true, Ordering::Release);
        }
        self.stopped.store(true, Ordering::Release);
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.idle.wait(&mut count);
        }
        debug!(?mode, "stopped bls worker pool");
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
