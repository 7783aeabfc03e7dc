//! Dual-sided queue bridging worker threads and async tasks.
//!
//! Items travel through a crossbeam channel. Thread-side consumers block in
//! [`QueueReceiver::recv_blocking`]; async consumers await
//! [`QueueReceiver::recv`], which parks on a tokio `Notify` signalled by every
//! send. Closing the queue wakes both kinds of waiter.

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Backpressure policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Never drops and never blocks. Required for audio paths.
    #[default]
    Unbounded,
    /// Bounded; a send into a full queue evicts the oldest item.
    DropOldest(usize),
    /// Bounded; a send into a full queue blocks the sending thread.
    Block(usize),
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    Closed(T),
    Full(T),
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => f.write_str("queue is closed"),
            SendError::Full(_) => f.write_str("queue is full"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for SendError<T> {}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(item) | SendError::Full(item) => item,
        }
    }
}

struct Shared {
    closed: AtomicBool,
    notify: Notify,
    // Dropped on close so blocked `select!` receivers wake up.
    close_tx: Mutex<Option<Sender<()>>>,
}

impl Shared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut guard) = self.close_tx.lock() {
            guard.take();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// Declared last in `QueueSender` so the channel sender is already gone when
// the wakeup fires.
#[derive(Clone)]
struct WakeOnDrop(Arc<Shared>);

impl Drop for WakeOnDrop {
    fn drop(&mut self) {
        self.0.notify.notify_one();
    }
}

/// Producer half. Cheap to clone; every clone feeds the same consumer.
pub struct QueueSender<T> {
    tx: Sender<T>,
    // Used for eviction and `clear_pending`.
    rx: Receiver<T>,
    policy: QueuePolicy,
    wake: WakeOnDrop,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            policy: self.policy,
            wake: self.wake.clone(),
        }
    }
}

/// Consumer half.
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    close_rx: Receiver<()>,
    shared: Arc<Shared>,
}

/// Creates a connected queue with the given policy.
pub fn dual_queue<T>(policy: QueuePolicy) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = match policy {
        QueuePolicy::Unbounded => crossbeam_channel::unbounded(),
        QueuePolicy::DropOldest(cap) | QueuePolicy::Block(cap) => {
            crossbeam_channel::bounded(cap.max(1))
        }
    };
    let (close_tx, close_rx) = crossbeam_channel::bounded(0);
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        notify: Notify::new(),
        close_tx: Mutex::new(Some(close_tx)),
    });

    let sender = QueueSender {
        tx,
        rx: rx.clone(),
        policy,
        wake: WakeOnDrop(Arc::clone(&shared)),
    };
    let receiver = QueueReceiver {
        rx,
        close_rx,
        shared,
    };
    (sender, receiver)
}

impl<T> QueueSender<T> {
    /// Enqueues `item` according to the queue policy.
    ///
    /// Only [`QueuePolicy::Block`] can block; use it from threads, never from
    /// async tasks.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        if self.is_closed() {
            return Err(SendError::Closed(item));
        }
        let result = match self.policy {
            QueuePolicy::Unbounded => self
                .tx
                .send(item)
                .map_err(|e| SendError::Closed(e.into_inner())),
            QueuePolicy::DropOldest(_) => self.send_evicting(item),
            QueuePolicy::Block(_) => self
                .tx
                .send(item)
                .map_err(|e| SendError::Closed(e.into_inner())),
        };
        if result.is_ok() {
            self.wake.0.notify.notify_one();
        }
        result
    }

    /// Enqueues without ever blocking; a full bounded queue returns
    /// [`SendError::Full`] unless the policy evicts.
    pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
        if self.is_closed() {
            return Err(SendError::Closed(item));
        }
        let result = match self.policy {
            QueuePolicy::DropOldest(_) => self.send_evicting(item),
            _ => self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(item) => SendError::Full(item),
                TrySendError::Disconnected(item) => SendError::Closed(item),
            }),
        };
        if result.is_ok() {
            self.wake.0.notify.notify_one();
        }
        result
    }

    fn send_evicting(&self, mut item: T) -> Result<(), SendError<T>> {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(item)) => return Err(SendError::Closed(item)),
                Err(TrySendError::Full(returned)) => {
                    item = returned;
                    // Another consumer may have emptied a slot in between.
                    let _evicted = self.rx.try_recv();
                }
            }
        }
    }

    /// Discards every queued item. Returns how many were dropped.
    pub fn clear_pending(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn close(&self) {
        self.wake.0.close();
    }

    pub fn is_closed(&self) -> bool {
        self.wake.0.is_closed()
    }
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item without blocking the executor.
    ///
    /// Returns `None` once the queue is closed or every sender is dropped.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if self.shared.is_closed() {
                return None;
            }
            match self.rx.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            // notify_one stores a permit, so a send between the check above
            // and this await is not lost.
            self.shared.notify.notified().await;
        }
    }

    /// Blocks the current thread until an item arrives or the queue closes.
    pub fn recv_blocking(&self) -> Option<T> {
        if self.shared.is_closed() {
            return None;
        }
        crossbeam_channel::select! {
            recv(self.rx) -> item => item.ok(),
            recv(self.close_rx) -> _ => None,
        }
    }

    /// Like [`recv_blocking`](Self::recv_blocking) but gives up after `timeout`.
    pub fn recv_blocking_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        if self.shared.is_closed() {
            return None;
        }
        crossbeam_channel::select! {
            recv(self.rx) -> item => item.ok(),
            recv(self.close_rx) -> _ => None,
            default(timeout) => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Takes everything still queued, ignoring the closed flag.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Converts the receiver into an async stream of items.
    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures_util::stream::unfold(self, |rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}

// Senders keep a receiver clone, so the channel alone never disconnects.
impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}
