//! Cooperative worker runner on the tokio scheduler.

use crate::error::{Result, VoxlineError};
use crate::worker::{
    AsyncWorker, ErrorReporter, LogReporter, QueuePolicy, QueueReceiver, QueueSender,
    ReadyNotifier, ReadySignal, ShutdownPolicy, WorkerError, WorkerHandle, dual_queue, ready_pair,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Parts<W: AsyncWorker> {
    worker: W,
    input: QueueReceiver<W::Input>,
    output: QueueSender<W::Output>,
    reporter: Arc<dyn ErrorReporter>,
    ready: ReadyNotifier,
}

/// Runs an [`AsyncWorker`] as a tokio task.
///
/// Termination cancels the task at its next await point unless the
/// shutdown policy asks to drain queued input first.
pub struct TaskWorker<W: AsyncWorker> {
    name: &'static str,
    input: QueueSender<W::Input>,
    output: QueueReceiver<W::Output>,
    ready: ReadySignal,
    shutdown: ShutdownPolicy,
    cancel: CancellationToken,
    parts: Mutex<Option<Parts<W>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl<W: AsyncWorker> TaskWorker<W> {
    pub fn new(worker: W) -> Self {
        Self::with_queue_policy(worker, QueuePolicy::Unbounded)
    }

    pub fn with_queue_policy(worker: W, policy: QueuePolicy) -> Self {
        let name = worker.name();
        let (input_tx, input_rx) = dual_queue(policy);
        let (output_tx, output_rx) = dual_queue(QueuePolicy::Unbounded);
        let (notifier, signal) = ready_pair(name);

        Self {
            name,
            input: input_tx,
            output: output_rx,
            ready: signal,
            shutdown: ShutdownPolicy::default(),
            cancel: CancellationToken::new(),
            parts: Mutex::new(Some(Parts {
                worker,
                input: input_rx,
                output: output_tx,
                reporter: Arc::new(LogReporter),
                ready: notifier,
            })),
            handle: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        if let Ok(Some(parts)) = self.parts.get_mut() {
            parts.reporter = reporter;
        }
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Token cancelled when this worker is terminated.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn run(parts: Parts<W>, shutdown: ShutdownPolicy, cancel: CancellationToken) {
        let Parts {
            mut worker,
            input,
            output,
            reporter,
            ready,
        } = parts;
        let name = worker.name();

        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WorkerError::Fatal("terminated before start".to_string())),
            result = worker.start() => result,
        };
        if let Err(e) = started {
            reporter.report(name, &e);
            ready.fail(e.to_string());
            worker.shutdown().await;
            return;
        }
        ready.ready();
        tracing::debug!(worker = name, "worker task started");

        let mut stopped = false;
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = input.recv() => item,
            };
            let Some(item) = item else { break };

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(worker = name, "in-flight item cancelled");
                    stopped = true;
                    break;
                }
                result = worker.process(item) => result,
            };
            if !Self::handle_result(name, result, &output, reporter.as_ref()) {
                stopped = true;
                break;
            }
        }

        if !stopped && shutdown == ShutdownPolicy::Drain {
            for item in input.drain() {
                let result = worker.process(item).await;
                if !Self::handle_result(name, result, &output, reporter.as_ref()) {
                    break;
                }
            }
        }

        worker.shutdown().await;
        tracing::debug!(worker = name, "worker task stopped");
    }

    fn handle_result(
        name: &'static str,
        result: std::result::Result<Option<W::Output>, WorkerError>,
        output: &QueueSender<W::Output>,
        reporter: &dyn ErrorReporter,
    ) -> bool {
        match result {
            Ok(Some(out)) => output.send(out).is_ok(),
            Ok(None) => true,
            Err(e) => {
                reporter.report(name, &e);
                !e.is_fatal()
            }
        }
    }
}

impl<W: AsyncWorker> WorkerHandle for TaskWorker<W> {
    type Input = W::Input;
    type Output = W::Output;

    fn name(&self) -> &'static str {
        self.name
    }

    /// Spawns the loop on the current tokio runtime.
    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            VoxlineError::WorkerStartFailed {
                worker: self.name.to_string(),
                message: e.to_string(),
            }
        })?;
        let parts = self
            .parts
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| VoxlineError::WorkerStartFailed {
                worker: self.name.to_string(),
                message: "already started".to_string(),
            })?;

        let handle = runtime.spawn(Self::run(parts, self.shutdown, self.cancel.clone()));
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    fn input(&self) -> &QueueSender<W::Input> {
        &self.input
    }

    fn output(&self) -> &QueueReceiver<W::Output> {
        &self.output
    }

    fn readiness(&self) -> &ReadySignal {
        &self.ready
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(worker = self.name, "terminating");
        self.input.close();
        if self.shutdown == ShutdownPolicy::Discard {
            self.cancel.cancel();
            self.output.close();
        }
        if let Ok(mut guard) = self.parts.lock() {
            guard.take();
        }
    }

    fn is_finished(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => guard.as_ref().is_none_or(|h| h.is_finished()),
            Err(_) => true,
        }
    }
}

impl<W: AsyncWorker> Drop for TaskWorker<W> {
    fn drop(&mut self) {
        self.terminate();
    }
}
