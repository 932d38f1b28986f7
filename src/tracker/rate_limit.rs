use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

pub const DEFAULT_PER_MINUTE: usize = 6;
pub const DEFAULT_PER_HOUR: usize = 120;

/// Sliding-window cap on classification attempts. Only attempts that were let through are
/// recorded.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    per_minute: usize,
    per_hour: usize,
    attempts: VecDeque<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_MINUTE, DEFAULT_PER_HOUR)
    }
}

impl RateLimiter {
    pub fn new(per_minute: usize, per_hour: usize) -> Self {
        Self {
            per_minute,
            per_hour,
            attempts: VecDeque::new(),
        }
    }

    /// Returns `true` if another attempt at `now` would exceed a cap. Otherwise records the
    /// attempt and returns `false`.
    pub fn is_rate_limited(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= HOUR {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        let last_minute = self
            .attempts
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < MINUTE)
            .count();

        if last_minute >= self.per_minute || self.attempts.len() >= self.per_hour {
            return true;
        }
        self.attempts.push_back(now);
        false
    }

    pub fn recorded_attempts(&self) -> usize {
        self.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_minute_cap() {
        let mut limiter = RateLimiter::new(6, 120);
        let start = Instant::now();
        for i in 0..6 {
            assert!(!limiter.is_rate_limited(start + Duration::from_secs(i)));
        }
        assert!(limiter.is_rate_limited(start + Duration::from_secs(9)));
        assert_eq!(limiter.recorded_attempts(), 6);

        // The first attempt leaves the minute window.
        assert!(!limiter.is_rate_limited(start + Duration::from_secs(60)));
        assert!(limiter.is_rate_limited(start + Duration::from_secs(60)));
        assert!(!limiter.is_rate_limited(start + Duration::from_secs(70)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_cap() {
        let mut limiter = RateLimiter::new(6, 10);
        let start = Instant::now();
        for i in 0..10 {
            assert!(!limiter.is_rate_limited(start + Duration::from_secs(i * 60)));
        }
        assert!(limiter.is_rate_limited(start + Duration::from_secs(20 * 60)));
        assert!(limiter.is_rate_limited(start + Duration::from_secs(59 * 60)));
        assert!(!limiter.is_rate_limited(start + Duration::from_secs(60 * 60)));
        assert_eq!(limiter.recorded_attempts(), 10);
    }
}
