//! Delay schedule for construction-time liveness probes.

use rand::Rng;
use std::time::Duration;

/// Upper bound on any single delay.
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Exponential backoff with up to 25% added jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self {
            next: initial.min(MAX_DELAY),
            max: MAX_DELAY,
        }
    }

    /// The base delay the next call to [`Backoff::next_delay`] will use.
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Return the next delay and double the base for the following one.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.max);

        let jitter_ms = base.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert_eq!(backoff.peek(), Duration::from_millis(200));
        backoff.next_delay();
        assert_eq!(backoff.peek(), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(4));
        backoff.next_delay();
        assert_eq!(backoff.peek(), MAX_DELAY);
        let delay = backoff.next_delay();
        assert!(delay <= MAX_DELAY + MAX_DELAY / 4);
    }

    #[test]
    fn test_zero_delay_stays_zero() {
        let mut backoff = Backoff::new(Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
