//! Task dispatch onto the owning thread.
//!
//! Any thread may queue work; only the owning thread drains it. Tasks queued
//! while a batch is draining wait for the next [`ImageTaskDispatcher::drain`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

/// A task to be executed on the owning thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called after a task is queued, so an event loop can schedule a drain.
pub type Waker = Arc<dyn Fn() + Send + Sync + 'static>;

struct DispatcherShared {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    owner: ThreadId,
    draining: AtomicBool,
    waker: Option<Waker>,
}

/// Serializes posted work onto one thread.
#[derive(Clone)]
pub struct ImageTaskDispatcher {
    shared: Arc<DispatcherShared>,
}

impl ImageTaskDispatcher {
    /// Create a dispatcher owned by the calling thread.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a dispatcher that calls `waker` whenever work is queued.
    pub fn with_waker(waker: Waker) -> Self {
        Self::build(Some(waker))
    }

    fn build(waker: Option<Waker>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(DispatcherShared {
                sender,
                receiver,
                owner: thread::current().id(),
                draining: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// Queue a task. Callable from any thread.
    pub fn queue_task(&self, task: Task) {
        // Both ends live in `shared`, so the channel never disconnects.
        if self.shared.sender.send(task).is_err() {
            warn!("Image task queue closed, dropping task");
            return;
        }
        if let Some(waker) = &self.shared.waker {
            waker();
        }
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn pending(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Run the tasks that were queued before this call.
    ///
    /// Returns how many ran. Re-entrant calls from inside a task return 0.
    pub fn drain(&self) -> usize {
        self.drain_batch(None)
    }

    /// Drain repeatedly until the queue is empty or `max_passes` is reached.
    pub fn run_until_idle(&self, max_passes: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_passes {
            let ran = self.drain();
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }

    /// Block until at least one task is queued, then drain.
    ///
    /// Returns 0 if nothing arrived before `timeout`.
    pub fn wait_and_drain(&self, timeout: Duration) -> usize {
        if self.pending() > 0 {
            return self.drain();
        }
        match self.shared.receiver.recv_deadline(Instant::now() + timeout) {
            Ok(first) => self.drain_batch(Some(first)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn drain_batch(&self, first: Option<Task>) -> usize {
        assert!(
            self.is_owner_thread(),
            "image tasks must be drained on the owning thread"
        );
        if self.shared.draining.swap(true, Ordering::AcqRel) {
            if let Some(task) = first {
                self.queue_task(task);
            }
            return 0;
        }
        let guard = DrainGuard(&self.shared.draining);

        let batch = self.shared.receiver.len();
        let mut ran = 0;
        if let Some(task) = first {
            task();
            ran += 1;
        }
        for _ in 0..batch {
            match self.shared.receiver.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(_) => break,
            }
        }

        drop(guard);
        if ran > 0 {
            trace!(ran, deferred = self.pending(), "Drained image tasks");
        }
        ran
    }
}

/// Clears the draining flag even when a task unwinds.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for ImageTaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// "Schedule if not already scheduled" guard.
///
/// Bursts of triggers coalesce into a single queued task.
#[derive(Debug, Default)]
pub struct SingleFlight(AtomicBool);

impl SingleFlight {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the slot. Returns false if a task is already outstanding.
    pub fn try_schedule(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the slot; called at task entry so a trigger during the task
    /// schedules a fresh pass.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
