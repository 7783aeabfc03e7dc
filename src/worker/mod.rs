//! Queue-driven workers.
//!
//! A worker owns an input queue and an output queue. [`ThreadWorker`] runs a
//! blocking [`Worker`] on a dedicated thread; [`TaskWorker`] runs an
//! [`AsyncWorker`] as a tokio task. Both expose the same [`WorkerHandle`]
//! surface to the conversation pipeline.

pub mod error;
pub mod queue;
pub mod task;
pub mod thread;

pub use error::{ErrorReporter, LogReporter, WorkerError};
pub use queue::{QueuePolicy, QueueReceiver, QueueSender, SendError, dual_queue};
pub use task::TaskWorker;
pub use thread::ThreadWorker;

use crate::error::{Result, VoxlineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// A blocking processing unit hosted on its own thread.
pub trait Worker: Send + 'static {
    /// The input type this worker receives.
    type Input: Send + 'static;
    /// The output type this worker produces.
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// Returns:
    /// - `Ok(Some(output))` - Successfully processed and produced output
    /// - `Ok(None)` - Successfully processed but no output
    /// - `Err(WorkerError)` - Processing failed
    fn process(&mut self, input: Self::Input) -> std::result::Result<Option<Self::Output>, WorkerError>;

    /// Returns the name of this worker for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Runs on the worker thread before the first item.
    ///
    /// An error here marks the worker as failed in [`ReadySignal`].
    fn start(&mut self) -> std::result::Result<(), WorkerError> {
        Ok(())
    }

    /// Called when the worker is shutting down.
    fn shutdown(&mut self) {}
}

/// A cooperative processing unit hosted on the tokio scheduler.
///
/// Implementations must not block; suspension happens only at awaits.
#[async_trait]
pub trait AsyncWorker: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    async fn process(
        &mut self,
        input: Self::Input,
    ) -> std::result::Result<Option<Self::Output>, WorkerError>;

    fn name(&self) -> &'static str;

    async fn start(&mut self) -> std::result::Result<(), WorkerError> {
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

/// What happens to queued input when a worker is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Drop queued items and abort in-flight async work.
    #[default]
    Discard,
    /// Finish queued items before stopping.
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// Observer side of a worker's start-up state.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    worker: &'static str,
    rx: watch::Receiver<Readiness>,
}

/// Setter side, moved into the worker loop.
#[derive(Debug)]
pub(crate) struct ReadyNotifier {
    tx: watch::Sender<Readiness>,
}

pub(crate) fn ready_pair(worker: &'static str) -> (ReadyNotifier, ReadySignal) {
    let (tx, rx) = watch::channel(Readiness::Pending);
    (ReadyNotifier { tx }, ReadySignal { worker, rx })
}

impl ReadyNotifier {
    pub(crate) fn ready(&self) {
        self.tx.send_replace(Readiness::Ready);
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        self.tx.send_replace(Readiness::Failed(message.into()));
    }
}

impl ReadySignal {
    /// Resolves once the worker finished its start hook.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| VoxlineError::WorkerStartFailed {
                worker: self.worker.to_string(),
                message: "worker stopped before becoming ready".to_string(),
            })?;
        match state {
            Readiness::Failed(message) => Err(VoxlineError::WorkerStartFailed {
                worker: self.worker.to_string(),
                message,
            }),
            _ => Ok(()),
        }
    }

    pub fn current(&self) -> Readiness {
        self.rx.borrow().clone()
    }
}

/// Uniform control surface over both worker flavors.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Begins the processing loop. Calling it twice is an error.
    fn start(&self) -> Result<()>;

    /// Producer handle for the input queue.
    fn input(&self) -> &QueueSender<Self::Input>;

    /// Pull side of the output queue.
    fn output(&self) -> &QueueReceiver<Self::Output>;

    fn readiness(&self) -> &ReadySignal;

    /// Signals shutdown. Idempotent; never blocks the caller.
    fn terminate(&self);

    /// True once the loop has exited.
    fn is_finished(&self) -> bool;

    /// Enqueues without blocking the caller.
    fn consume_nonblocking(&self, item: Self::Input) -> Result<()> {
        self.input()
            .try_send(item)
            .map_err(|e| match e {
                SendError::Closed(_) => VoxlineError::WorkerNotRunning {
                    worker: self.name().to_string(),
                },
                SendError::Full(_) => VoxlineError::QueueFull {
                    queue: self.name().to_string(),
                },
            })
    }

    async fn ready(&self) -> Result<()> {
        self.readiness().wait().await
    }

    /// Waits up to `timeout` for the loop to exit. Returns true if it did.
    async fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(10);
        while !self.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(worker = self.name(), "shutdown timeout, detaching");
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
        true
    }
}
