// SPDX-License-Identifier: MIT
//! Cooperative cancellation for externally exposed operations.
//!
//! Every public coordinator operation accepts a [`CancelToken`]. Cancellation
//! is cooperative: operations check the token at suspension-point boundaries
//! (before store round-trips, before oracle calls). A mutation that already
//! reached the store commit is never rolled back — cancellation only prevents
//! *new* work from starting.

use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Error returned when an operation observes cancellation.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub deadline_exceeded: bool,
}

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.deadline_exceeded {
            write!(f, "operation cancelled (deadline exceeded)")
        } else {
            write!(f, "operation cancelled")
        }
    }
}

impl std::error::Error for Cancelled {}

/// Owner side of a cancellation domain. Dropping the source does NOT cancel;
/// call [`CancelSource::cancel`] explicitly (shutdown paths want to cancel,
/// scope exits do not).
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            CancelToken {
                rx,
                deadline: None,
            },
        )
    }

    /// Signal every token derived from this source.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cheaply cloneable cancellation handle with an optional deadline.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires. Useful for tests and internal callers.
    pub fn never() -> Self {
        static NEVER: once_cell::sync::Lazy<watch::Sender<bool>> =
            once_cell::sync::Lazy::new(|| watch::channel(false).0);
        Self {
            rx: NEVER.subscribe(),
            deadline: None,
        }
    }

    /// Derive a child token sharing the parent's cancel signal but with its
    /// own (tighter) deadline.
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            rx: self.rx.clone(),
            // Child deadlines only tighten, never extend.
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Check the token at a suspension-point boundary.
    pub fn check(&self) -> Result<(), Cancelled> {
        if *self.rx.borrow() {
            return Err(Cancelled {
                deadline_exceeded: false,
            });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Cancelled {
                deadline_exceeded: true,
            });
        }
        Ok(())
    }

    /// Resolve when the source fires or the deadline passes. Used by loops
    /// (`tokio::select!` against the work future).
    pub async fn cancelled(&mut self) {
        let sleep_until = self.deadline;
        let wait_signal = async {
            // Channel closure counts as cancellation for loop shutdown.
            while !*self.rx.borrow() {
                if self.rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match sleep_until {
            Some(d) => {
                tokio::select! {
                    _ = wait_signal => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(d)) => {}
                }
            }
            None => wait_signal.await,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("has_deadline", &self.deadline.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_starts_live() {
        let (_src, token) = CancelSource::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[tokio::test]
    async fn cancel_fires_all_clones() {
        let (src, token) = CancelSource::new();
        let clone = token.clone();
        src.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
        assert!(!clone.check().unwrap_err().deadline_exceeded);
    }

    #[tokio::test]
    async fn deadline_expires() {
        let (_src, token) = CancelSource::new();
        let short = token.with_deadline(Duration::from_millis(10));
        assert!(!short.is_cancelled());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(short.is_cancelled());
        assert!(short.check().unwrap_err().deadline_exceeded);
        // Parent unaffected.
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn child_deadline_only_tightens() {
        let (_src, token) = CancelSource::new();
        let tight = token.with_deadline(Duration::from_millis(10));
        let loose = tight.with_deadline(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(loose.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let (src, mut token) = CancelSource::new();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        src.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }
}
