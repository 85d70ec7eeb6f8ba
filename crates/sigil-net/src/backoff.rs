//! Exponential reconnect delay.

use std::time::Duration;

use sigil_shared::constants::{BACKOFF_CEILING, BACKOFF_FLOOR};

/// Doubling delay between `floor` and `ceiling`. There is no cap on the
/// number of attempts, only on the delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait before the next attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Called on every successful open.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_FLOOR, BACKOFF_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_ceiling() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_delays_are_monotonic() {
        let mut backoff = Backoff::new(Duration::from_millis(300), Duration::from_secs(5));
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(5));
            previous = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), BACKOFF_FLOOR);
    }

    #[test]
    fn test_ceiling_below_floor_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
