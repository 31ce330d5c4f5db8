//! Lifecycle signal shared by the supervisor, listener, and console.
//!
//! The signal is held in a [`watch`] channel so every task observes the
//! latest value without racing and can await changes instead of polling.
//! Moving to [`LifecycleSignal::Terminate`] is one-way.

use std::sync::Arc;
use tokio::sync::watch;

/// Control value coordinating start and stop decisions across tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    /// Normal operation.
    Running,
    /// A default configuration was written; the operator must review it.
    NeedsReconfig,
    /// A startup step failed; the server must not serve.
    StartupError,
    /// Terminal state. No component accepts new work once observed.
    Terminate,
}

impl std::fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::NeedsReconfig => "needs-reconfig",
            Self::StartupError => "startup-error",
            Self::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// Cloneable handle to the shared [`LifecycleSignal`].
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleSignal>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Create a lifecycle in the [`LifecycleSignal::Running`] state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleSignal::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Current signal value.
    #[must_use]
    pub fn get(&self) -> LifecycleSignal {
        *self.tx.borrow()
    }

    /// Replace the signal.
    ///
    /// Returns `false` without modifying anything if the signal is already
    /// [`LifecycleSignal::Terminate`].
    pub fn set(&self, signal: LifecycleSignal) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|current| {
            if *current == LifecycleSignal::Terminate {
                return false;
            }
            applied = true;
            if *current == signal {
                return false;
            }
            *current = signal;
            true
        });
        applied
    }

    /// Move to [`LifecycleSignal::Terminate`].
    pub fn terminate(&self) {
        self.set(LifecycleSignal::Terminate);
    }

    /// Whether the terminal state has been reached.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.get() == LifecycleSignal::Terminate
    }

    /// Subscribe to signal changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleSignal> {
        self.tx.subscribe()
    }

    /// Wait until the signal reaches [`LifecycleSignal::Terminate`].
    pub async fn wait_for_terminate(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| *s == LifecycleSignal::Terminate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[test]
    fn starts_running() {
        assert_eq!(Lifecycle::new().get(), LifecycleSignal::Running);
    }

    #[rstest]
    #[case(LifecycleSignal::Running)]
    #[case(LifecycleSignal::NeedsReconfig)]
    #[case(LifecycleSignal::StartupError)]
    fn terminate_is_one_way(#[case] attempted: LifecycleSignal) {
        let lifecycle = Lifecycle::new();
        lifecycle.terminate();
        assert!(!lifecycle.set(attempted));
        assert!(lifecycle.is_terminating());
    }

    #[test]
    fn clones_share_state() {
        let lifecycle = Lifecycle::new();
        let other = lifecycle.clone();
        assert!(other.set(LifecycleSignal::StartupError));
        assert_eq!(lifecycle.get(), LifecycleSignal::StartupError);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();
        lifecycle.set(LifecycleSignal::NeedsReconfig);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), LifecycleSignal::NeedsReconfig);
    }

    #[tokio::test]
    async fn wait_for_terminate_wakes_on_terminate() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_for_terminate().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        lifecycle.terminate();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
    }

    #[tokio::test]
    async fn wait_for_terminate_returns_immediately_when_terminated() {
        let lifecycle = Lifecycle::new();
        lifecycle.terminate();
        tokio::time::timeout(Duration::from_millis(100), lifecycle.wait_for_terminate())
            .await
            .expect("already terminated");
    }
}
