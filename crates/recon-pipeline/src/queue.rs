//! Bounded hand-off queues between stages, and the shutdown signal observed
//! at every pull.
//!
//! A queue carries whole chains in FIFO order. Pushing to a full queue blocks
//! (backpressure); pulling from an empty one blocks until a chain arrives,
//! every sender is gone, or shutdown is signalled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use recon_core::MessageChain;

/// Create a queue holding at most `capacity` chains.
pub fn stage_queue(capacity: usize) -> (ChainSender, ChainReceiver) {
    let (tx, rx) = bounded(capacity);
    (ChainSender { tx }, ChainReceiver { rx })
}

/// Producer end. Cloneable; the queue closes when every clone is dropped.
#[derive(Debug, Clone)]
pub struct ChainSender {
    tx: Sender<MessageChain>,
}

impl ChainSender {
    /// Move `chain` into the queue, blocking while it is full.
    ///
    /// Fails only if the consumer is gone; the chain is handed back.
    pub fn push(&self, chain: MessageChain) -> Result<(), QueueError> {
        self.tx
            .send(chain)
            .map_err(|e| QueueError::Closed(Box::new(e.into_inner())))
    }

    /// Chains currently waiting.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer end, owned by exactly one worker.
#[derive(Debug)]
pub struct ChainReceiver {
    rx: Receiver<MessageChain>,
}

/// Result of a pull.
#[derive(Debug)]
pub enum Pulled {
    Chain(MessageChain),
    /// Every producer is gone and the queue is empty.
    Closed,
    /// Shutdown was signalled; nothing was taken from the queue.
    Stopped,
}

impl ChainReceiver {
    /// Block until a chain arrives or the queue closes.
    pub fn pull(&self) -> Option<MessageChain> {
        self.rx.recv().ok()
    }

    /// Block until a chain arrives, the queue closes, or `signal` fires.
    pub fn pull_or_stop(&self, signal: &ShutdownSignal) -> Pulled {
        if signal.is_triggered() {
            return Pulled::Stopped;
        }
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(chain) => Pulled::Chain(chain),
                Err(_) => Pulled::Closed,
            },
            recv(signal.inner.stop_rx) -> _ => Pulled::Stopped,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The consumer has exited. Carries the chain that was not delivered.
    #[error("queue closed: consumer has exited")]
    Closed(Box<MessageChain>),
}

impl QueueError {
    pub fn into_chain(self) -> MessageChain {
        match self {
            QueueError::Closed(chain) => *chain,
        }
    }
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

/// Pipeline-wide run/drain flag.
///
/// Triggering drops the only sender of a zero-capacity channel, which wakes
/// every worker blocked in `pull_or_stop` at once.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    draining: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        Self {
            inner: Arc::new(SignalInner {
                draining: AtomicBool::new(false),
                stop_tx: Mutex::new(Some(stop_tx)),
                stop_rx,
            }),
        }
    }

    /// Idempotent.
    pub fn trigger(&self) {
        self.inner.draining.store(true, Ordering::Release);
        let mut guard = self
            .inner
            .stop_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
