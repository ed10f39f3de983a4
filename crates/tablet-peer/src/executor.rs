//! Thread pools and suspension primitives.
//!
//! Four named pools back the core: *prepare* (single thread, an ordering
//! anchor), *leader-apply* and *replica-apply* (multi-thread), and
//! *log-gc* (single thread, not modeled as a pool since it only ever runs
//! one loop — see [`ShutdownLatch`]). Submitting to a pool blocks the caller
//! when its bounded queue is full.

use std::sync::mpsc::{self, RecvError};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named, bounded thread pool.
///
/// Jobs submitted to a single-thread pool run in strict submission order,
/// which is what makes the *prepare* pool an ordering anchor.
pub struct WorkerPool {
    name: String,
    sender: Option<mpsc::SyncSender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers named `{name}-{n}`, sharing a bounded
    /// MPMC job queue of the given capacity.
    pub fn new(name: impl Into<String>, threads: usize, capacity: usize) -> Self {
        assert!(threads > 0, "pool must have at least one thread");
        let name = name.into();
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity.max(1));
        let receiver = std::sync::Arc::new(Mutex::new(receiver));

        let handles = (0..threads)
            .map(|i| {
                let receiver = std::sync::Arc::clone(&receiver);
                let thread_name = format!("{name}-{i}");
                thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || Self::run(&receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            name,
            sender: Some(sender),
            handles,
        }
    }

    fn run(receiver: &Mutex<mpsc::Receiver<Job>>) {
        loop {
            let job: Result<Job, RecvError> = {
                let guard = receiver.lock().expect("worker queue mutex poisoned");
                guard.recv()
            };
            match job {
                Ok(job) => job(),
                Err(RecvError) => break,
            }
        }
    }

    /// Enqueues a job, blocking if the pool's queue is full.
    ///
    /// Returns `Err(())` if the pool has already been shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), ()> {
        match &self.sender {
            Some(sender) => sender.send(Box::new(job)).map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Closes the job queue and joins every worker thread.
    pub fn shutdown(mut self) {
        tracing::debug!(pool = %self.name, "shutting down worker pool");
        self.sender = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Serializes the hand-off from Prepare to Replicate so that, for any two
/// leader operations A and B, A entering Prepare before B implies A is
/// submitted to consensus before B.
///
/// The *prepare* pool already runs single-threaded, so Prepare callbacks
/// execute in submission order; this latch extends that guarantee to the
/// replicate hand-off even if a future Prepare implementation yields control
/// before calling into consensus.
#[derive(Default)]
pub struct PrepareReplicateLatch(Mutex<()>);

impl PrepareReplicateLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `submit` while holding the latch, serializing it against every
    /// other caller of `with_latch`.
    pub fn with_latch<T>(&self, submit: impl FnOnce() -> T) -> T {
        let _guard = self.0.lock().expect("prepare/replicate latch poisoned");
        submit()
    }
}

/// An interruptible sleep used by the log-GC loop: sleeping returns early,
/// and for good, once [`ShutdownLatch::trip`] is called.
pub struct ShutdownLatch {
    tripped: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self {
            tripped: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn trip(&self) {
        let mut tripped = self.tripped.lock().expect("shutdown latch poisoned");
        *tripped = true;
        self.condvar.notify_all();
    }

    pub fn is_tripped(&self) -> bool {
        *self.tripped.lock().expect("shutdown latch poisoned")
    }

    /// Sleeps up to `duration`, waking early if tripped. Returns `true` if
    /// the latch was (or became) tripped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.tripped.lock().expect("shutdown latch poisoned");
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, duration, |tripped| !*tripped)
            .expect("shutdown latch poisoned");
        *guard
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-use, blocking completion channel used to notify a driver when
/// consensus has assigned an OpId and reached quorum for its round.
pub fn oneshot<T: Send + 'static>() -> (OneshotSender<T>, OneshotReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (OneshotSender(tx), OneshotReceiver(rx))
}

pub struct OneshotSender<T>(mpsc::SyncSender<T>);

impl<T> OneshotSender<T> {
    /// Best-effort: if the receiver was already dropped, the result is
    /// silently discarded (the driver that would have consumed it is gone).
    pub fn send(self, value: T) {
        let _ = self.0.send(value);
    }
}

pub struct OneshotReceiver<T>(mpsc::Receiver<T>);

impl<T> OneshotReceiver<T> {
    /// Blocks until the sender fires, or returns `None` if it was dropped
    /// without sending.
    pub fn recv(self) -> Option<T> {
        self.0.recv().ok()
    }
}
