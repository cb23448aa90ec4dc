//! Per-source request throttling.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Gate that admits at most one call per `3600 / requests_per_hour` seconds per source.
///
/// Denied callers must skip or reschedule; `allow` never blocks. Each source
/// key is updated under its own shard lock so unrelated sources never
/// serialize on each other.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_call: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_interval(requests_per_hour: u32) -> Duration {
        if requests_per_hour == 0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(3600.0 / f64::from(requests_per_hour))
    }

    pub fn allow(&self, source_id: &str, requests_per_hour: u32) -> bool {
        self.allow_at(source_id, requests_per_hour, Instant::now())
    }

    pub fn allow_at(&self, source_id: &str, requests_per_hour: u32, now: Instant) -> bool {
        let min_interval = Self::min_interval(requests_per_hour);
        match self.last_call.entry(source_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                let elapsed = now.saturating_duration_since(*slot.get());
                if elapsed >= min_interval {
                    slot.insert(now);
                    true
                } else {
                    debug!(
                        source_id,
                        wait_ms = (min_interval - elapsed).as_millis() as u64,
                        "rate limited"
                    );
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sixty_per_hour_admits_one_call_per_minute() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.allow_at("acme", 60, t0));
        assert!(!limiter.allow_at("acme", 60, t0 + Duration::from_secs(30)));
        assert!(!limiter.allow_at("acme", 60, t0 + Duration::from_secs(59)));
        assert!(limiter.allow_at("acme", 60, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn denied_call_does_not_move_the_window() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.allow_at("acme", 60, t0));
        assert!(!limiter.allow_at("acme", 60, t0 + Duration::from_secs(45)));
        // measured from t0, not from the denied attempt
        assert!(limiter.allow_at("acme", 60, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn non_positive_rate_defaults_to_one_second() {
        assert_eq!(RateLimiter::min_interval(0), Duration::from_secs(1));
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.allow_at("feed", 0, t0));
        assert!(!limiter.allow_at("feed", 0, t0 + Duration::from_millis(500)));
        assert!(limiter.allow_at("feed", 0, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn sources_are_throttled_independently() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.allow_at("a", 1, t0));
        assert!(limiter.allow_at("b", 1, t0));
        assert!(!limiter.allow_at("a", 1, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn concurrent_callers_get_a_single_admission() {
        let limiter = Arc::new(RateLimiter::new());
        let now = Instant::now();
        let handles = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.allow_at("shared", 60, now))
            })
            .collect::<Vec<_>>();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(admitted, 1);
    }
}
