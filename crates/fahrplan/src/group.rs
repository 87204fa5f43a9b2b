//! The scheduling group: public surface, monitor loop, and dispatch pass.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cancel::{CancelReason, CancelToken};
use crate::error::GroupError;
use crate::task::{BoxFuture, TaskFn, TaskHeap};
use crate::waitgroup::WaitGroup;

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent configuration for a [`Group`].
///
/// # Example
/// ```
/// # use fahrplan::{CancelToken, Group};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let group = Group::builder().name("reaper").build(CancelToken::new());
/// # }
/// ```
pub struct GroupBuilder {
    name: String,
}

impl GroupBuilder {
    /// Create a builder with the default name (`"group"`).
    pub fn new() -> Self {
        Self {
            name: "group".to_string(),
        }
    }

    /// Set the label used for this group in log output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build the group and start its monitor. See [`Group::new`].
    pub fn build(self, cancel: CancelToken) -> Group {
        Group::start(self.name, cancel)
    }
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Group ────────────────────────────────────────────────────────────

/// A worker pool that runs scheduled tasks once their deadline passes.
///
/// Producers hand the group nullary async callbacks with a deadline via
/// [`schedule`](Self::schedule), [`schedule_at`](Self::schedule_at), or
/// [`delay`](Self::delay); a single monitor task sleeps until the earliest
/// deadline and dispatches every due callback on its own Tokio task. One
/// caller then blocks in [`wait`](Self::wait) until everything has completed
/// or the group's [`CancelToken`] fires.
///
/// Handles are cheap to clone and all address the same group. A group must
/// not be used again once [`wait`](Self::wait) has returned.
#[derive(Clone)]
pub struct Group {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    /// Caller's token; observed by `wait`.
    cancel: CancelToken,
    /// Derived child token; fires to stop the monitor.
    monitor_cancel: CancelToken,
    /// Heap and phase flag, serialized by one mutex.
    state: Mutex<State>,
    /// Monitor plus every launched body.
    running: WaitGroup,
    /// One-slot "a task was added" kick; sends never block and drop on full.
    add_tx: mpsc::Sender<()>,
    /// Latest heap length, published after every dispatch pass.
    len_tx: watch::Sender<usize>,
}

struct State {
    tasks: TaskHeap,
    /// Set on `wait` entry; scheduling afterwards is a contract violation.
    waiting: bool,
}

impl Group {
    /// Create a group that uses `cancel` for cancellation and start its
    /// monitor. If cancellation is not a concern, pass a fresh
    /// [`CancelToken::new`].
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(cancel: CancelToken) -> Self {
        Self::builder().build(cancel)
    }

    /// Start configuring a group. See [`GroupBuilder`].
    pub fn builder() -> GroupBuilder {
        GroupBuilder::new()
    }

    fn start(name: String, cancel: CancelToken) -> Self {
        let monitor_cancel = cancel.child();
        let (add_tx, add_rx) = mpsc::channel(1);
        let (len_tx, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            name,
            cancel,
            monitor_cancel,
            state: Mutex::new(State {
                tasks: TaskHeap::new(),
                waiting: false,
            }),
            running: WaitGroup::new(),
            add_tx,
            len_tx,
        });

        let monitor_guard = shared.running.guard();
        let monitor_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _running = monitor_guard;
            monitor(monitor_shared, add_rx).await;
        });

        debug!(group = %shared.name, "scheduling group started");
        Self { shared }
    }

    /// Label used for this group in log output.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedule `body` to run at or after `when`. A past or present `when`
    /// runs the body as soon as possible. Never blocks on the body.
    ///
    /// # Panics
    ///
    /// Panics if called after [`wait`](Self::wait) has been entered.
    pub fn schedule<F, Fut>(&self, when: Instant, body: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule_boxed(when, Box::new(move || Box::pin(body()) as BoxFuture));
    }

    /// Schedule `body` at a wall-clock instant. A past instant runs the body
    /// as soon as possible.
    ///
    /// # Panics
    ///
    /// Panics if called after [`wait`](Self::wait) has been entered.
    pub fn schedule_at<F, Fut>(&self, when: DateTime<Utc>, body: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule(Instant::now() + delay, body);
    }

    /// Schedule `body` to run once `delay` has elapsed. `Duration::ZERO`
    /// runs the body as soon as possible.
    ///
    /// # Panics
    ///
    /// Panics if called after [`wait`](Self::wait) has been entered.
    pub fn delay<F, Fut>(&self, delay: Duration, body: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Instant::now() + delay, body);
    }

    fn schedule_boxed(&self, when: Instant, call: TaskFn) {
        let id = Uuid::new_v4();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.waiting {
                drop(state);
                panic!("schedule called after wait on scheduling group");
            }
            state.tasks.push(when, id, call);
        }

        trace!(
            group = %self.shared.name,
            task_id = %id,
            deadline_in = ?when.saturating_duration_since(Instant::now()),
            "task scheduled"
        );

        // Kick the monitor. A full slot or a gone receiver both mean the
        // kick is not needed: a wake-up is already pending, or the monitor
        // has exited and the heap is abandoned.
        let _ = self.shared.add_tx.try_send(());
    }

    /// Wait for the completion of every scheduled task, or for cancellation.
    ///
    /// Returns the cancel token's reason if it fires at any point, including
    /// before entry (without consulting the heap). Returns `Ok(())` once the
    /// heap is empty and every launched body has finished; tasks left on the
    /// heap at cancellation are silently abandoned, while bodies already
    /// dispatched keep running but are no longer awaited.
    ///
    /// Single-shot: call from at most one task, and do not use the group
    /// again afterwards.
    pub async fn wait(&self) -> Result<(), GroupError> {
        // Cancellation takes priority, even over an already-drained heap.
        if let Some(reason) = self.shared.cancel.reason() {
            return Err(GroupError::Cancelled(reason));
        }

        let mut len_rx = self.shared.len_tx.subscribe();

        let is_empty = {
            let mut state = self.shared.state.lock().unwrap();
            state.waiting = true;
            state.tasks.is_empty()
        };
        if is_empty {
            return self.drain().await;
        }

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    return Err(self.cancel_error());
                }
                _ = len_rx.changed() => {
                    // A count and a cancellation can arrive in the same
                    // wake-up; cancellation still wins.
                    if self.shared.cancel.is_cancelled() {
                        return Err(self.cancel_error());
                    }
                    if *len_rx.borrow_and_update() == 0 {
                        return self.drain().await;
                    }
                }
            }
        }
    }

    /// Stop the monitor, then wait for it and every launched body to finish.
    async fn drain(&self) -> Result<(), GroupError> {
        self.shared.monitor_cancel.cancel();
        self.shared.running.wait().await;
        debug!(group = %self.shared.name, "scheduling group drained");
        Ok(())
    }

    fn cancel_error(&self) -> GroupError {
        GroupError::Cancelled(
            self.shared
                .cancel
                .reason()
                .unwrap_or(CancelReason::Cancelled),
        )
    }
}

// ── Monitor ──────────────────────────────────────────────────────────

/// Dispatcher loop: sleeps until the next deadline, wakes early when a task
/// is added or the group is cancelled.
async fn monitor(shared: Arc<Shared>, mut add_rx: mpsc::Receiver<()>) {
    // Single reusable timer, re-armed every pass.
    let sleep = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(sleep);

    loop {
        if shared.monitor_cancel.is_cancelled() {
            debug!(group = %shared.name, "monitor stopped");
            return;
        }

        let now = Instant::now();
        let armed = match shared.trigger(now) {
            Some(next) => {
                sleep.as_mut().reset(next);
                true
            }
            // Heap is empty; stay parked until a task is added.
            None => false,
        };

        tokio::select! {
            _ = shared.monitor_cancel.cancelled() => {}
            _ = add_rx.recv() => {}
            _ = &mut sleep, if armed => {}
        }
    }
}

impl Shared {
    /// Launch every task whose deadline is at or before `now`, in deadline
    /// order. Returns the next pending deadline, or `None` when the heap is
    /// empty.
    ///
    /// The remaining heap length is published before the mutex is released
    /// so `wait` observes counts in dispatch-pass order.
    fn trigger(&self, now: Instant) -> Option<Instant> {
        let mut state = self.state.lock().unwrap();

        while let Some(task) = state.tasks.pop_due(now) {
            trace!(group = %self.name, task_id = %task.id, "dispatching task");
            let running = self.running.guard();
            tokio::spawn(async move {
                let _running = running;
                (task.call)().await;
            });
        }

        let next = state.tasks.peek_deadline();
        self.len_tx.send_replace(state.tasks.len());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_defaults() {
        let group = Group::builder().build(CancelToken::new());
        assert_eq!(group.name(), "group");
    }

    #[tokio::test]
    async fn builder_sets_the_name() {
        let group = Group::builder().name("reaper").build(CancelToken::new());
        assert_eq!(group.name(), "reaper");
    }

    #[tokio::test]
    async fn clones_address_the_same_group() {
        let group = Group::new(CancelToken::new());
        let clone = group.clone();
        assert!(Arc::ptr_eq(&group.shared, &clone.shared));
    }
}
