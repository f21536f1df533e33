//! Cancellable execution context for gateway discovery
//!
//! A [`DiscoveryContext`] carries an optional deadline and any number of
//! cancel signals inherited from its ancestors. It is cheap to clone and is
//! handed to every discoverer so that all of them observe the same
//! cancellation.
//!
//! # Example
//!
//! ```no_run
//! use natgate::DiscoveryContext;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let (ctx, cancel) = DiscoveryContext::new();
//! let ctx = ctx.with_timeout(Duration::from_secs(3));
//!
//! // Abort from elsewhere
//! cancel.cancel();
//! assert!(ctx.err().is_some());
//! # }
//! ```

use futures::future;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Why a context finished
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ContextError {
    /// [`CancelHandle::cancel`] was called on this context or an ancestor
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellable execution context
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Cancels the context it was created with, and every context derived from it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signal cancellation. Calling it more than once has no further effect.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl DiscoveryContext {
    /// A context that never finishes on its own
    pub fn background() -> Self {
        Self {
            signals: Vec::new(),
            deadline: None,
        }
    }

    /// A new root context together with the handle that cancels it
    pub fn new() -> (Self, CancelHandle) {
        Self::background().child()
    }

    /// Derive a context that is cancelled when either `self` or the returned
    /// handle is cancelled
    pub fn child(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(rx);
        let ctx = Self {
            signals,
            deadline: self.deadline,
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// Derive a context that also finishes after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that also finishes at `deadline`
    ///
    /// The earlier of the inherited and the new deadline applies.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            signals: self.signals.clone(),
            deadline: Some(deadline),
        }
    }

    /// Deadline of this context, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check; `Some` once the context has finished
    pub fn err(&self) -> Option<ContextError> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        if let Some(err) = self.err() {
            return err;
        }

        let cancelled = wait_any(self.signals.clone());
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => ContextError::Cancelled,
                _ = time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                ContextError::Cancelled
            }
        }
    }
}

impl Default for DiscoveryContext {
    fn default() -> Self {
        Self::background()
    }
}

async fn wait_any(signals: Vec<watch::Receiver<bool>>) {
    let mut waits: FuturesUnordered<_> = signals.into_iter().map(wait_cancelled).collect();
    if waits.next().await.is_none() {
        // No signals at all
        future::pending::<()>().await;
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling: this signal can never fire
            return future::pending().await;
        }
    }
}
