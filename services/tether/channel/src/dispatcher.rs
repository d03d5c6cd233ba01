//! Pluggable event dispatch.
//!
//! Channels never call application handlers directly: every event is handed
//! to a [`Dispatcher`] as a boxed job. The dispatcher decides on which thread
//! the job runs, which keeps the resilience layers agnostic to the threading
//! requirements of whoever consumes their events.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

/// A unit of work carrying one event to its handlers
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Strategy for running event handlers
pub trait Dispatcher: Send + Sync + fmt::Debug {
    /// Run or schedule the job
    fn invoke(&self, job: Job);
}

/// Runs jobs immediately on the calling thread.
///
/// Used between the internal layers of a composite channel, where the caller
/// is already a transport or timer task and ordering must be preserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncDispatcher;

impl Dispatcher for SyncDispatcher {
    fn invoke(&self, job: Job) {
        job();
    }
}

/// Runs jobs one at a time, in submission order, on a dedicated worker task.
pub struct SerialDispatcher {
    jobs: mpsc::UnboundedSender<Job>,
}

impl SerialDispatcher {
    /// Spawn the worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Event handler panicked on serial dispatcher");
                }
            }
            trace!("Serial dispatcher worker stopped");
        });

        Self { jobs }
    }
}

impl Default for SerialDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SerialDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDispatcher")
            .field("closed", &self.jobs.is_closed())
            .finish()
    }
}

impl Dispatcher for SerialDispatcher {
    fn invoke(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("Serial dispatcher worker is gone; dropping event");
        }
    }
}

/// Runs each job on the blocking thread pool. No ordering guarantee.
#[derive(Debug, Clone)]
pub struct PoolDispatcher {
    runtime: Handle,
}

impl PoolDispatcher {
    /// Bind to the current runtime's blocking pool.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new() -> Self {
        Self {
            runtime: Handle::current(),
        }
    }
}

impl Default for PoolDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for PoolDispatcher {
    fn invoke(&self, job: Job) {
        self.runtime.spawn_blocking(job);
    }
}
