//! Stop signal shared between the pipeline owner and the capture thread
//!
//! The signal is a flume channel nobody ever sends on. Dropping the sender
//! disconnects it, which wakes every receiver blocked in `recv_timeout` at once.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};

/// Owner side: fires the signal once
#[derive(Debug)]
pub struct Canceller {
    tx: Mutex<Option<Sender<()>>>,
    token: CancelToken,
}

/// Observer side: cheap to clone, polled by blocking waits
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Arc<Receiver<()>>,
}

impl Canceller {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            token: CancelToken { rx: Arc::new(rx) },
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Idempotent
    pub fn cancel(&self) {
        let mut tx = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that is never cancelled, for driving sources outside a capture loop
    pub fn never() -> Self {
        let (tx, rx) = flume::bounded(0);
        // Leaked sender keeps the channel connected for the token's lifetime
        std::mem::forget(tx);
        Self { rx: Arc::new(rx) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_disconnected()
    }

    /// Sleep for `timeout` unless cancelled first. Returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) => self.is_cancelled(),
        }
    }

    /// Sleep until `deadline` unless cancelled first. Returns true when cancelled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if deadline <= now {
            return self.is_cancelled();
        }
        self.wait_timeout(deadline - now)
    }

    /// Resolves once cancelled, for async owners
    pub async fn cancelled(&self) {
        while self.rx.recv_async().await.is_ok() {}
    }
}
