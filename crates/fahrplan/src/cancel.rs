//! One-shot cancellation tokens.
//!
//! A [`CancelToken`] carries a "done" signal observable from async code and,
//! once fired, a terminal [`CancelReason`]. Tokens form a hierarchy: a child
//! created with [`CancelToken::child`] observes its ancestors' cancellation,
//! while cancelling the child leaves the ancestors untouched.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Terminal reason reported by a fired [`CancelToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    /// [`CancelToken::cancel`] was called.
    #[error("cancel token fired")]
    Cancelled,

    /// The token's deadline passed before it was cancelled.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A cheaply cloneable one-shot cancellation handle.
///
/// All clones address the same token: the first [`cancel`](Self::cancel)
/// (or deadline expiry) wins, every later one is a no-op.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// `None` until the token fires; the first write is final.
    state: watch::Sender<Option<CancelReason>>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Create a token that only fires when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    /// Create a token that fires with [`CancelReason::DeadlineExceeded`] once
    /// `deadline` passes, unless cancelled earlier.
    ///
    /// Spawns a timer task, so this must be called within a Tokio runtime.
    pub fn with_deadline(deadline: Instant) -> Self {
        let token = Self::new();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    timer.fire(CancelReason::DeadlineExceeded);
                }
                _ = timer.cancelled() => {}
            }
        });
        token
    }

    /// Create a token that fires `timeout` from now. See
    /// [`with_deadline`](Self::with_deadline).
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Derive a child token.
    ///
    /// The child observes the cancellation of this token and all its
    /// ancestors in addition to its own.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    fn with_parent(parent: Option<CancelToken>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner { state, parent }),
        }
    }

    /// Fire the token with [`CancelReason::Cancelled`]. Idempotent.
    pub fn cancel(&self) {
        self.fire(CancelReason::Cancelled);
    }

    fn fire(&self, reason: CancelReason) {
        self.inner.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Terminal reason, or `None` while the token (and every ancestor) is
    /// still live.
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = *self.inner.state.borrow() {
            return Some(reason);
        }
        self.inner.parent.as_ref().and_then(|parent| parent.reason())
    }

    /// Whether the token or any of its ancestors has fired.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the token or any of its ancestors fires; immediately if
    /// that already happened.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.state.subscribe();
        let own = rx.wait_for(|state| state.is_some());
        match &self.inner.parent {
            Some(parent) => {
                tokio::select! {
                    _ = Box::pin(parent.cancelled()) => {}
                    _ = own => {}
                }
            }
            None => {
                // The sender lives in `self.inner`, so the channel cannot close.
                let _ = own.await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::timeout;

    #[tokio::test]
    async fn cancel_sets_reason_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);

        token.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));

        // A second cancel must not overwrite the reason.
        token.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_fired() {
        let token = CancelToken::new();
        token.cancel();

        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve for a fired token");
    }

    #[tokio::test]
    async fn clones_share_the_same_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn child_observes_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();

        parent.cancel();

        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some(CancelReason::Cancelled));
        timeout(Duration::from_millis(100), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
    }

    #[tokio::test]
    async fn cancelling_child_leaves_parent_running() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(parent.reason(), None);
    }

    #[tokio::test]
    async fn grandchild_observes_root_cancellation() {
        let root = CancelToken::new();
        let grandchild = root.child().child();

        root.cancel();

        assert!(grandchild.is_cancelled());
        timeout(Duration::from_millis(100), grandchild.cancelled())
            .await
            .expect("grandchild should observe root cancellation");
    }

    #[tokio::test]
    async fn deadline_token_fires_with_deadline_exceeded() {
        let token = CancelToken::with_timeout(Duration::from_millis(50));

        timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("deadline should fire the token");
        assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn manual_cancel_beats_the_deadline() {
        let token = CancelToken::with_timeout(Duration::from_secs(30));
        token.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
    }
}
