//! Per-call context: cancellation, deadline and preview mode
//!
//! Every lifecycle call receives a [`CallContext`]. Cancellation is signalled
//! through a `tokio::sync::watch` channel so one [`CancelHandle`] (for example a
//! Ctrl-C handler) can stop whatever call is currently in flight.

use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Sender half used to cancel in-flight calls
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Context handed to every lifecycle call
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    /// Compute the would-be state without dialing or executing anything
    pub dry_run: bool,
}

impl CallContext {
    /// Context with its own cancel handle and no deadline
    pub fn new() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancel: rx,
                deadline: None,
                timeout: None,
                dry_run: false,
            },
            CancelHandle {
                tx: std::sync::Arc::new(tx),
            },
        )
    }

    /// Context that can never be cancelled
    pub fn background() -> Self {
        Self::new().0
    }

    /// Bound the whole call to `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// The configured timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time left before the deadline; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the call is cancelled. Pends forever if every
    /// [`CancelHandle`] has been dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Resolves once the deadline passes. Pends forever without a deadline.
    pub async fn deadline_elapsed(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
            None => futures::future::pending::<()>().await,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (ctx, handle) = CallContext::new();
        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_background_never_cancels() {
        let ctx = CallContext::background();
        let result = tokio::time::timeout(Duration::from_millis(50), ctx.cancelled()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_deadline() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.timeout(), Some(Duration::from_millis(20)));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(20));
        ctx.deadline_elapsed().await;
        assert!(ctx.deadline_passed());
    }
}
