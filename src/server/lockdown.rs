use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Server-wide throttle after authentication failures.
///
/// Every failure starts or restarts a window of `duration`. While the window
/// is open new connections are refused and a further failure drops the
/// offending connection.
#[derive(Debug)]
pub struct LockdownState {
    duration: Duration,
    until: Mutex<Option<Instant>>,
}

impl LockdownState {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        let until = (*self.until.lock())?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    /// Record a failure; returns whether a window was already open
    pub fn register_failure(&self) -> bool {
        let mut until = self.until.lock();
        let now = Instant::now();
        let was_active = until.map(|u| now < u).unwrap_or(false);
        *until = Some(now + self.duration);
        was_active
    }

    pub fn clear(&self) {
        *self.until.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_opens_and_expires() {
        let lockdown = LockdownState::new(Duration::from_secs(3));
        assert!(!lockdown.is_active());
        assert!(!lockdown.register_failure());
        assert!(lockdown.is_active());
        assert!(lockdown.register_failure());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(lockdown.is_active());
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!lockdown.is_active());
        assert!(!lockdown.register_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restarts_window() {
        let lockdown = LockdownState::new(Duration::from_secs(3));
        lockdown.register_failure();
        tokio::time::advance(Duration::from_secs(2)).await;
        lockdown.register_failure();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(lockdown.is_active());
        lockdown.clear();
        assert!(!lockdown.is_active());
    }
}
