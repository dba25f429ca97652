//! Cancellation helpers shared by every long-running task.
//!
//! Every suspending call takes a `CancellationToken`. Deadlines are expressed
//! as child tokens so that a task always observes the earliest of its own
//! deadline and any cancellation coming from above.

use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Sleep for `delay`. Returns `false` if `token` fired first.
pub async fn sleep_or_cancelled(delay: Duration, token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Sleep until wall-clock `at`. Returns `false` if `token` fired first.
pub async fn sleep_until_or_cancelled(at: SystemTime, token: &CancellationToken) -> bool {
    sleep_or_cancelled(until(at), token).await
}

/// Time from now until `at`, zero if already past.
pub fn until(at: SystemTime) -> Duration {
    at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)
}

/// Child of `parent` that is also cancelled at `deadline`.
///
/// Must be called inside a tokio runtime. The timer task exits as soon as the
/// child is cancelled by either source.
pub fn deadline_token(parent: &CancellationToken, deadline: SystemTime) -> CancellationToken {
    let child = parent.child_token();
    let timer = child.clone();
    let delay = until(deadline);
    tokio::spawn(async move {
        if sleep_or_cancelled(delay, &timer).await {
            timer.cancel();
        }
    });
    child
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancelled(Duration::from_millis(5), &token).await);
    }

    #[tokio::test]
    async fn cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        assert!(!sleep_or_cancelled(Duration::from_secs(30), &token).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deadline_fires_before_parent() {
        let parent = CancellationToken::new();
        let child = deadline_token(&parent, SystemTime::now() + Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), child.cancelled())
            .await
            .expect("deadline should cancel child");
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child_before_deadline() {
        let parent = CancellationToken::new();
        let child = deadline_token(&parent, SystemTime::now() + Duration::from_secs(3600));
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(5), child.cancelled())
            .await
            .expect("parent cancel should propagate");
    }

    #[tokio::test]
    async fn past_deadline_cancels_immediately() {
        let parent = CancellationToken::new();
        let child = deadline_token(&parent, SystemTime::now() - Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(5), child.cancelled())
            .await
            .expect("past deadline should cancel");
    }
}
