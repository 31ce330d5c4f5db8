//! Utility helpers for asynchronous tests.

use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Pause between checks in [`eventually`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `check` until it returns `true` or `timeout` elapses.
///
/// Returns the result of the final check.
///
/// # Examples
///
/// ```rust,ignore
/// use std::time::Duration;
/// use test_support::eventually;
///
/// let ready = eventually(Duration::from_secs(1), || server.connections().is_empty()).await;
/// assert!(ready);
/// ```
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    check()
}
