use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use moka::sync::Cache;
use strum_macros::{AsRefStr, EnumString};

const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_KEY_CAPACITY: u64 = 100_000;

/// How requests are counted against a key's allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RateLimitStrategy {
    /// Fixed 24 hour window starting at a key's first request.
    Daily,
    /// Sliding window of the configured length.
    Rolling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    strategy: RateLimitStrategy,
    max_requests: u32,
    window: Duration,
}

impl RateLimitConfig {
    pub fn new(strategy: RateLimitStrategy, max_requests: u32, window: Duration) -> Self {
        let window = match strategy {
            RateLimitStrategy::Daily => DAILY_WINDOW,
            RateLimitStrategy::Rolling => window.max(Duration::from_millis(1)),
        };
        Self {
            strategy,
            max_requests: max_requests.max(1),
            window,
        }
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.strategy
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

#[derive(Debug)]
struct FixedWindow {
    opened_at: Instant,
    count: u32,
}

/// Per-key request limiter kept entirely in memory. Idle keys are evicted by
/// the cache once their window has elapsed.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Windows,
}

#[derive(Clone)]
enum Windows {
    Fixed(Cache<String, Arc<Mutex<FixedWindow>>>),
    Rolling(Cache<String, Arc<Mutex<VecDeque<Instant>>>>),
}

fn window_cache<V>(idle: Duration) -> Cache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .time_to_idle(idle)
        .max_capacity(DEFAULT_KEY_CAPACITY)
        .build()
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let windows = match config.strategy {
            RateLimitStrategy::Daily => Windows::Fixed(window_cache(config.window)),
            RateLimitStrategy::Rolling => Windows::Rolling(window_cache(config.window)),
        };
        Self { config, windows }
    }

    /// Counts one request for `key` and reports whether it may proceed.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        match &self.windows {
            Windows::Fixed(cache) => self.check_fixed(cache, key, now),
            Windows::Rolling(cache) => self.check_rolling(cache, key, now),
        }
    }

    fn check_fixed(
        &self,
        cache: &Cache<String, Arc<Mutex<FixedWindow>>>,
        key: &str,
        now: Instant,
    ) -> RateLimitDecision {
        let entry = cache.get_with(key.to_owned(), || {
            Arc::new(Mutex::new(FixedWindow {
                opened_at: now,
                count: 0,
            }))
        });
        let mut window = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if now.saturating_duration_since(window.opened_at) >= self.config.window {
            window.opened_at = now;
            window.count = 0;
        }
        if window.count >= self.config.max_requests {
            let elapsed = now.saturating_duration_since(window.opened_at);
            return RateLimitDecision::Limited {
                retry_after: self.config.window.saturating_sub(elapsed),
            };
        }
        window.count += 1;
        RateLimitDecision::Allowed {
            remaining: self.config.max_requests - window.count,
        }
    }

    fn check_rolling(
        &self,
        cache: &Cache<String, Arc<Mutex<VecDeque<Instant>>>>,
        key: &str,
        now: Instant,
    ) -> RateLimitDecision {
        let entry = cache.get_with(key.to_owned(), || Arc::new(Mutex::new(VecDeque::new())));
        let mut hits = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(oldest) = hits.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.config.max_requests as usize {
            let retry_after = hits
                .front()
                .map(|oldest| {
                    self.config
                        .window
                        .saturating_sub(now.saturating_duration_since(*oldest))
                })
                .unwrap_or_default();
            return RateLimitDecision::Limited { retry_after };
        }
        hits.push_back(now);
        RateLimitDecision::Allowed {
            remaining: self.config.max_requests - hits.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn strategy_tags_parse_case_insensitively() {
        assert_eq!(RateLimitStrategy::from_str("daily"), Ok(RateLimitStrategy::Daily));
        assert_eq!(RateLimitStrategy::from_str("Rolling"), Ok(RateLimitStrategy::Rolling));
        assert!(RateLimitStrategy::from_str("composite").is_err());
    }

    #[test]
    fn limiter_keeps_only_the_store_for_its_strategy() {
        let daily = RateLimiter::new(RateLimitConfig::new(
            RateLimitStrategy::Daily,
            1,
            Duration::ZERO,
        ));
        assert!(matches!(daily.windows, Windows::Fixed(_)));
        let rolling = RateLimiter::new(RateLimitConfig::new(
            RateLimitStrategy::Rolling,
            1,
            Duration::from_secs(1),
        ));
        assert!(matches!(rolling.windows, Windows::Rolling(_)));
    }

    #[test]
    fn daily_window_ignores_configured_length() {
        let config = RateLimitConfig::new(RateLimitStrategy::Daily, 10, Duration::from_secs(5));
        assert_eq!(config.window(), DAILY_WINDOW);
    }

    #[test]
    fn fixed_window_limits_per_key() {
        let limiter = RateLimiter::new(RateLimitConfig::new(
            RateLimitStrategy::Daily,
            2,
            Duration::ZERO,
        ));
        let now = Instant::now();
        assert_eq!(
            limiter.check_at("a", now),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check_at("a", now),
            RateLimitDecision::Allowed { remaining: 0 }
        );
        assert!(matches!(
            limiter.check_at("a", now),
            RateLimitDecision::Limited { .. }
        ));
        assert_eq!(
            limiter.check_at("b", now),
            RateLimitDecision::Allowed { remaining: 1 }
        );
    }

    #[test]
    fn fixed_window_resets_after_expiry() {
        let limiter = RateLimiter::new(RateLimitConfig::new(
            RateLimitStrategy::Daily,
            1,
            Duration::ZERO,
        ));
        let now = Instant::now();
        assert!(matches!(
            limiter.check_at("a", now),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("a", now + Duration::from_secs(60)),
            RateLimitDecision::Limited { .. }
        ));
        assert!(matches!(
            limiter.check_at("a", now + DAILY_WINDOW),
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[test]
    fn rolling_window_releases_oldest_hit() {
        let limiter = RateLimiter::new(RateLimitConfig::new(
            RateLimitStrategy::Rolling,
            2,
            Duration::from_secs(10),
        ));
        let start = Instant::now();
        assert!(matches!(
            limiter.check_at("k", start),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("k", start + Duration::from_secs(4)),
            RateLimitDecision::Allowed { .. }
        ));
        assert_eq!(
            limiter.check_at("k", start + Duration::from_secs(6)),
            RateLimitDecision::Limited {
                retry_after: Duration::from_secs(4)
            }
        );
        assert_eq!(
            limiter.check_at("k", start + Duration::from_secs(10)),
            RateLimitDecision::Allowed { remaining: 0 }
        );
    }
}
