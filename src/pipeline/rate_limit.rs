use std::time::{Duration, Instant};

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Enforces a minimum interval between two published gestures.
///
/// The check never sleeps: a throttled gesture is simply not emitted and
/// capture keeps its own cadence.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns `true` when an emission at `now` would come too soon after the
    /// previous one. An emission that is allowed through becomes the new
    /// reference point.
    pub fn should_throttle(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return true;
            }
        }
        self.last_emit = Some(now);
        false
    }

    /// Time left before the next emission would be allowed.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last_emit {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emission_passes() {
        let mut limiter = RateLimiter::default();
        assert!(!limiter.should_throttle(Instant::now()));
    }

    #[test]
    fn emissions_inside_interval_are_throttled() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(!limiter.should_throttle(start));
        assert!(limiter.should_throttle(start + Duration::from_millis(100)));
        assert!(limiter.should_throttle(start + Duration::from_millis(999)));
        assert!(!limiter.should_throttle(start + Duration::from_secs(1)));
    }

    #[test]
    fn throttled_calls_do_not_move_the_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_millis(500));
        assert!(!limiter.should_throttle(start));
        assert!(limiter.should_throttle(start + Duration::from_millis(400)));
        assert!(!limiter.should_throttle(start + Duration::from_millis(600)));
        assert!(limiter.should_throttle(start + Duration::from_millis(1_000)));
    }

    #[test]
    fn remaining_counts_down() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(1));
        assert_eq!(limiter.remaining_at(start), Duration::ZERO);
        limiter.should_throttle(start);
        assert_eq!(
            limiter.remaining_at(start + Duration::from_millis(250)),
            Duration::from_millis(750)
        );
        assert_eq!(
            limiter.remaining_at(start + Duration::from_secs(3)),
            Duration::ZERO
        );
    }

    #[test]
    fn zero_interval_never_throttles() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::ZERO);
        assert!(!limiter.should_throttle(start));
        assert!(!limiter.should_throttle(start));
    }
}
