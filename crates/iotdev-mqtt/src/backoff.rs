//! Reconnect wait policy shared by the event loop and the offline coordinator.

use std::sync::Mutex;
use std::time::Duration;

/// Produces the wait before each reconnect attempt.
///
/// The event loop calls [`Backoff::next_wait`] after every failed poll; the
/// coordinator calls [`Backoff::reset`] once a connection becomes stable.
pub trait Backoff: Send + Sync {
    fn next_wait(&self) -> Duration;
    fn reset(&self);
}

/// Doubling wait between `base` and `max`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current: Mutex<Duration>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            current: Mutex::new(base),
        }
    }

    pub fn current(&self) -> Duration {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Backoff for ExponentialBackoff {
    fn next_wait(&self) -> Duration {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let wait = *current;
        *current = (wait * 2).min(self.max);
        wait
    }

    fn reset(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let b = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let waits: Vec<u64> = (0..5).map(|_| b.next_wait().as_millis() as u64).collect();
        assert_eq!(waits, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn reset_returns_to_base() {
        let b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        b.next_wait();
        b.next_wait();
        assert_eq!(b.current(), Duration::from_secs(4));
        b.reset();
        assert_eq!(b.next_wait(), Duration::from_secs(1));
    }
}
