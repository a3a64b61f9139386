//! Inbound-activity deadline monitoring.
//!
//! Both ends track when they last heard from their peer. Every inbound
//! message (including keepalive markers) calls [`Activity::touch`]; the
//! watchdog returns [`DeadlineResult::TimedOut`] once a full `timeout` has
//! elapsed without a touch.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of the watchdog loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineResult {
    /// The peer stayed silent for the whole timeout.
    TimedOut,
    /// The watchdog was cancelled externally.
    Cancelled,
}

/// Timestamp of the last inbound message.
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    /// Start tracking from now.
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last touch.
    pub fn elapsed(&self) -> Duration {
        self.last.lock().elapsed()
    }

    fn deadline(&self, timeout: Duration) -> Instant {
        *self.last.lock() + timeout
    }
}

/// Wait until `activity` has been silent for `timeout`, or until cancelled.
pub async fn watch_deadline(
    activity: &Activity,
    timeout: Duration,
    cancel: &CancellationToken,
) -> DeadlineResult {
    loop {
        let deadline = activity.deadline(timeout);
        if Instant::now() >= deadline {
            return DeadlineResult::TimedOut;
        }
        tokio::select! {
            () = time::sleep_until(deadline) => {}
            () = cancel.cancelled() => return DeadlineResult::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_when_silent() {
        let activity = Activity::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let result = watch_deadline(&activity, Duration::from_millis(300), &cancel).await;
        assert_eq!(result, DeadlineResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn touches_push_the_deadline_out() {
        let activity = Arc::new(Activity::new());
        let cancel = CancellationToken::new();
        let toucher = Arc::clone(&activity);
        let _ = tokio::spawn(async move {
            for _ in 0..5 {
                time::sleep(Duration::from_millis(100)).await;
                toucher.touch();
            }
        });
        let start = Instant::now();
        let result = watch_deadline(&activity, Duration::from_millis(200), &cancel).await;
        assert_eq!(result, DeadlineResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test]
    async fn cancelled() {
        let activity = Activity::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = watch_deadline(&activity, Duration::from_secs(60), &cancel).await;
        assert_eq!(result, DeadlineResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_resets_on_touch() {
        let activity = Activity::new();
        time::sleep(Duration::from_millis(50)).await;
        assert!(activity.elapsed() >= Duration::from_millis(50));
        activity.touch();
        assert_eq!(activity.elapsed(), Duration::ZERO);
    }
}
