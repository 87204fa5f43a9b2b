//! Structural counter over outstanding workers.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts outstanding workers; [`wait`](WaitGroup::wait) resolves once the
/// count drops to zero.
#[derive(Debug, Clone)]
pub(crate) struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

/// One reserved slot in a [`WaitGroup`], released on drop.
///
/// Dropping on panic still releases the slot, so a failing worker cannot
/// leave the group waiting forever.
#[derive(Debug)]
pub(crate) struct WorkGuard {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            count: Arc::new(watch::channel(0).0),
        }
    }

    /// Reserve a slot; the returned guard releases it when dropped.
    pub fn guard(&self) -> WorkGuard {
        self.count.send_modify(|count| *count += 1);
        WorkGuard {
            count: self.count.clone(),
        }
    }

    /// Resolves once every outstanding guard has been dropped; immediately if
    /// none are live.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new();
        timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("an idle group should not block");
    }

    #[tokio::test]
    async fn wait_blocks_until_every_guard_drops() {
        let wg = WaitGroup::new();
        let first = wg.guard();
        let second = wg.guard();

        assert!(timeout(Duration::from_millis(50), wg.wait()).await.is_err());

        drop(first);
        assert!(timeout(Duration::from_millis(50), wg.wait()).await.is_err());

        drop(second);
        timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("all guards dropped");
    }

    #[tokio::test]
    async fn guard_releases_when_a_task_panics() {
        let wg = WaitGroup::new();
        let guard = wg.guard();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("worker failed");
        });
        let join_err = handle.await.expect_err("task should panic");
        assert!(join_err.is_panic());

        timeout(Duration::from_millis(200), wg.wait())
            .await
            .expect("slot should be released despite the panic");
    }
}
