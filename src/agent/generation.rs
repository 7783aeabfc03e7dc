use crate::agent::ResponseFragment;
use crate::error::{Result, VoxlineError};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FRAGMENT_BUFFER: usize = 32;

/// Producer handle given to the task that generates a response.
#[derive(Clone)]
pub struct FragmentSender {
    tx: mpsc::Sender<Result<ResponseFragment>>,
    cancel: CancellationToken,
}

impl FragmentSender {
    /// Forwards a fragment. Fails with [`VoxlineError::Cancelled`] once the
    /// consumer cancelled or went away.
    pub async fn send(&self, fragment: ResponseFragment) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(VoxlineError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(VoxlineError::Cancelled),
            sent = self.tx.send(Ok(fragment)) => sent.map_err(|_| VoxlineError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A finite, single-pass response stream.
///
/// Reading past the end (or after an error or cancellation) returns
/// [`VoxlineError::GenerationConsumed`]. Dropping a generation cancels it.
pub struct Generation {
    rx: mpsc::Receiver<Result<ResponseFragment>>,
    cancel: CancellationToken,
    finished: bool,
}

impl Generation {
    /// Runs `produce` as a task feeding this generation.
    ///
    /// The task observes a child of `cancel`, so cancelling the parent or
    /// dropping the generation both stop it.
    pub fn spawn<F, Fut>(cancel: &CancellationToken, produce: F) -> Self
    where
        F: FnOnce(FragmentSender) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let sender = FragmentSender {
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let producer = produce(sender);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = task_cancel.cancelled() => Err(VoxlineError::Cancelled),
                result = producer => result,
            };
            match result {
                Ok(()) => {}
                Err(VoxlineError::Cancelled) => {
                    tracing::debug!("generation cancelled");
                }
                Err(e) => {
                    if tx.send(Err(e)).await.is_err() {
                        tracing::debug!("generation failed after consumer left");
                    }
                }
            }
        });

        Self {
            rx,
            cancel,
            finished: false,
        }
    }

    /// A generation that yields `fragments` without doing any work.
    pub fn from_fragments(fragments: Vec<ResponseFragment>) -> Self {
        let (tx, rx) = mpsc::channel(fragments.len().max(1));
        for fragment in fragments {
            if tx.try_send(Ok(fragment)).is_err() {
                break;
            }
        }
        Self {
            rx,
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// A generation that fails immediately.
    pub fn failed(error: VoxlineError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        if tx.try_send(Err(error)).is_err() {
            tracing::debug!("failed generation dropped its error");
        }
        Self {
            rx,
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// Next fragment, `Ok(None)` at the end of the response.
    pub async fn next(&mut self) -> Result<Option<ResponseFragment>> {
        if self.finished {
            return Err(VoxlineError::GenerationConsumed);
        }
        let item = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.finished = true;
                return Err(VoxlineError::Cancelled);
            }
            item = self.rx.recv() => item,
        };
        match item {
            Some(Ok(fragment)) => Ok(Some(fragment)),
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Collects the remaining fragments.
    pub async fn collect(mut self) -> Result<Vec<ResponseFragment>> {
        let mut fragments = Vec::new();
        while let Some(fragment) = self.next().await? {
            fragments.push(fragment);
        }
        Ok(fragments)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
