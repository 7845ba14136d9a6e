use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Shortest pause between two samples
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// The condition is sampled immediately and then every `check_interval`; the
/// last sleep is shortened so the wait ends exactly at the deadline. On timeout
/// `on_timeout` runs once and `false` is returned. A zero `check_interval` is
/// raised to one millisecond.
pub async fn wait_for<C, T>(
    mut condition: C,
    timeout: Duration,
    check_interval: Duration,
    on_timeout: T,
) -> bool
where
    C: FnMut() -> bool,
    T: FnOnce(),
{
    let check_interval = check_interval.max(MIN_CHECK_INTERVAL);
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            on_timeout();
            return false;
        }
        sleep(check_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_at_deadline() {
        let timeout = Duration::from_secs(15);
        let start = Instant::now();
        let mut samples = 0;
        let mut timeouts = 0;

        let reached = wait_for(
            || {
                samples += 1;
                false
            },
            timeout,
            Duration::from_millis(100),
            || timeouts += 1,
        )
        .await;

        assert!(!reached);
        assert_eq!(timeouts, 1);
        assert_eq!(start.elapsed(), timeout);
        assert!((150..=151).contains(&samples));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_clamps_last_sleep() {
        let start = Instant::now();
        let reached = wait_for(
            || false,
            Duration::from_millis(250),
            Duration::from_millis(100),
            || {},
        )
        .await;

        assert!(!reached);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_zero_interval_still_sleeps() {
        let start = Instant::now();
        let mut samples = 0;

        let reached = wait_for(
            || {
                samples += 1;
                false
            },
            Duration::from_millis(20),
            Duration::ZERO,
            || {},
        )
        .await;

        assert!(!reached);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
        assert!((11..=21).contains(&samples));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_returns_once_condition_holds() {
        let start = Instant::now();
        let mut samples = 0;
        let mut timed_out = false;

        let reached = wait_for(
            || {
                samples += 1;
                samples == 3
            },
            Duration::from_secs(15),
            Duration::from_millis(100),
            || timed_out = true,
        )
        .await;

        assert!(reached);
        assert!(!timed_out);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }
}
