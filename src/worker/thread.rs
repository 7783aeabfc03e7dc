//! Thread-backed worker runner.

use crate::error::{Result, VoxlineError};
use crate::worker::{
    ErrorReporter, LogReporter, QueuePolicy, QueueReceiver, QueueSender, ReadyNotifier,
    ReadySignal, ShutdownPolicy, Worker, WorkerError, WorkerHandle, dual_queue, ready_pair,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

struct Parts<W: Worker> {
    worker: W,
    input: QueueReceiver<W::Input>,
    output: QueueSender<W::Output>,
    reporter: Arc<dyn ErrorReporter>,
    ready: ReadyNotifier,
}

/// Runs a [`Worker`] on a dedicated OS thread.
///
/// Callers on the async side interact only through the dual queues, so
/// blocking calls inside `process` never stall the scheduler.
pub struct ThreadWorker<W: Worker> {
    name: &'static str,
    input: QueueSender<W::Input>,
    output: QueueReceiver<W::Output>,
    ready: ReadySignal,
    shutdown: ShutdownPolicy,
    parts: Mutex<Option<Parts<W>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl<W: Worker> ThreadWorker<W> {
    /// Wraps `worker` with unbounded queues.
    pub fn new(worker: W) -> Self {
        Self::with_queue_policy(worker, QueuePolicy::Unbounded)
    }

    /// Wraps `worker` with an input queue using `policy`.
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

    /// Main processing loop for the worker thread.
    fn run(parts: Parts<W>, shutdown: ShutdownPolicy) {
        let Parts {
            mut worker,
            input,
            output,
            reporter,
            ready,
        } = parts;
        let name = worker.name();

        if let Err(e) = worker.start() {
            reporter.report(name, &e);
            ready.fail(e.to_string());
            worker.shutdown();
            return;
        }
        ready.ready();
        tracing::debug!(worker = name, "worker thread started");

        let mut stopped = false;
        while let Some(item) = input.recv_blocking() {
            if !Self::step(&mut worker, item, &output, reporter.as_ref()) {
                stopped = true;
                break;
            }
        }

        if !stopped && shutdown == ShutdownPolicy::Drain {
            for item in input.drain() {
                if !Self::step(&mut worker, item, &output, reporter.as_ref()) {
                    break;
                }
            }
        }

        worker.shutdown();
        tracing::debug!(worker = name, "worker thread stopped");
    }

    /// Processes one item. Returns false when the loop must stop.
    fn step(
        worker: &mut W,
        item: W::Input,
        output: &QueueSender<W::Output>,
        reporter: &dyn ErrorReporter,
    ) -> bool {
        match worker.process(item) {
            Ok(Some(out)) => {
                // A closed output queue means nobody is listening anymore.
                output.send(out).is_ok()
            }
            Ok(None) => true,
            Err(e @ WorkerError::Recoverable(_)) => {
                reporter.report(worker.name(), &e);
                true
            }
            Err(e @ WorkerError::Fatal(_)) => {
                reporter.report(worker.name(), &e);
                false
            }
        }
    }

    /// Blocks until the worker thread exits or `timeout` elapses.
    ///
    /// Intended for thread-side callers; async callers use
    /// [`WorkerHandle::wait_finished`].
    pub fn join_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let poll_interval = std::time::Duration::from_millis(10);
        loop {
            if self.is_finished() {
                self.reap();
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll_interval);
        }
    }

    // Joins a finished thread to surface panics.
    fn reap(&self) {
        let Ok(mut guard) = self.handle.lock() else {
            return;
        };
        if let Some(handle) = guard.take_if(|h| h.is_finished())
            && let Err(panic_info) = handle.join()
        {
            let msg = panic_info
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("unknown panic");
            tracing::error!(worker = self.name, panic = msg, "worker thread panicked");
        }
    }
}

impl<W: Worker> WorkerHandle for ThreadWorker<W> {
    type Input = W::Input;
    type Output = W::Output;

    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self) -> Result<()> {
        let parts = self
            .parts
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| VoxlineError::WorkerStartFailed {
                worker: self.name.to_string(),
                message: "already started".to_string(),
            })?;

        let shutdown = self.shutdown;
        let handle = thread::Builder::new()
            .name(format!("voxline-{}", self.name))
            .spawn(move || Self::run(parts, shutdown))
            .map_err(|e| VoxlineError::WorkerStartFailed {
                worker: self.name.to_string(),
                message: e.to_string(),
            })?;

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
        // Drained output disconnects on its own once the thread exits.
        if self.shutdown == ShutdownPolicy::Discard {
            self.output.close();
        }
        // A never-started worker still owns its parts; release them.
        if let Ok(mut guard) = self.parts.lock()
            && let Some(mut parts) = guard.take()
        {
            parts.worker.shutdown();
        }
    }

    fn is_finished(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => guard.as_ref().is_none_or(|h| h.is_finished()),
            Err(_) => true,
        }
    }
}

impl<W: Worker> Drop for ThreadWorker<W> {
    fn drop(&mut self) {
        self.terminate();
    }
}
