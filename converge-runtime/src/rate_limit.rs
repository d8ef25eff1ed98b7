//! Requeue rate limiting: per-identity exponential backoff under a shared
//! global admission ceiling.
use std::{hash::Hash, time::Duration};

use ahash::AHashMap;
use tokio::time::Instant;

/// Parameters of a [`RateLimiter`]
#[derive(Debug, Clone)]
pub struct Config {
    /// Delay after the first consecutive failure of an identity; doubles per
    /// further failure
    pub base_delay: Duration,
    /// Upper bound on the per-identity exponential delay
    pub max_delay: Duration,
    /// Minimum spacing between granted admissions across *all* identities
    ///
    /// This is the shared ceiling that keeps a thundering herd of failing
    /// items from being re-admitted at once; the effective delay of one
    /// re-add is the maximum of its exponential delay and this spacing.
    pub admission_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            admission_interval: Duration::from_millis(10),
        }
    }
}

/// Decides how long a failed request must wait before re-admission
///
/// Each identity carries a consecutive-failure count driving capped
/// exponential backoff (`base * 2^(failures - 1)`); a successful, clean
/// reconciliation [`forget`](RateLimiter::forget)s the identity and resets
/// its backoff to zero. All identities additionally share one admission
/// ceiling, so the combined delay is `max(exponential, global spacing)`.
#[derive(Debug)]
pub struct RateLimiter<R> {
    config: Config,
    failures: AHashMap<R, u32>,
    next_admission: Instant,
}

impl<R: Eq + Hash + Clone> RateLimiter<R> {
    /// Create a limiter with the given parameters
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            failures: AHashMap::new(),
            next_admission: Instant::now(),
        }
    }

    /// Consecutive failures recorded for `item`
    #[must_use]
    pub fn failures(&self, item: &R) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    /// Record a failure of `item` and return the delay before its re-add
    pub fn next_delay(&mut self, item: &R) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exponent = (*failures).min(31);
        *failures = failures.saturating_add(1);
        let exponential = self
            .config
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.config.max_delay);
        exponential.max(self.admit(Instant::now()))
    }

    /// Drop all failure state for `item`
    ///
    /// Called after a clean success so the next failure starts over at
    /// `base_delay`.
    pub fn forget(&mut self, item: &R) {
        self.failures.remove(item);
    }

    /// Reserve the next global admission slot, returning how far away it is
    fn admit(&mut self, now: Instant) -> Duration {
        let at = self.next_admission.max(now);
        self.next_admission = at + self.config.admission_interval;
        at - now
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, RateLimiter};
    use std::time::Duration;

    fn no_ceiling(base: Duration, max: Duration) -> Config {
        Config {
            base_delay: base,
            max_delay: max,
            admission_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn delays_grow_exponentially_until_capped() {
        tokio::time::pause();
        let mut limiter = RateLimiter::new(no_ceiling(
            Duration::from_millis(5),
            Duration::from_millis(35),
        ));
        let item = "w1";
        assert_eq!(limiter.next_delay(&item), Duration::from_millis(5));
        assert_eq!(limiter.next_delay(&item), Duration::from_millis(10));
        assert_eq!(limiter.next_delay(&item), Duration::from_millis(20));
        // Capped by max_delay from here on
        assert_eq!(limiter.next_delay(&item), Duration::from_millis(35));
        assert_eq!(limiter.next_delay(&item), Duration::from_millis(35));
        assert_eq!(limiter.failures(&item), 5);
    }

    #[tokio::test]
    async fn forgetting_resets_backoff_to_zero() {
        tokio::time::pause();
        let mut limiter = RateLimiter::new(no_ceiling(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        ));
        let item = "w1";
        limiter.next_delay(&item);
        limiter.next_delay(&item);
        assert_eq!(limiter.failures(&item), 2);
        limiter.forget(&item);
        assert_eq!(limiter.failures(&item), 0);
        assert_eq!(limiter.next_delay(&item), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn identities_back_off_independently() {
        tokio::time::pause();
        let mut limiter = RateLimiter::new(no_ceiling(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        ));
        limiter.next_delay(&"a");
        limiter.next_delay(&"a");
        assert_eq!(limiter.next_delay(&"b"), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn global_ceiling_spaces_admissions_across_identities() {
        tokio::time::pause();
        let mut limiter = RateLimiter::new(Config {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            admission_interval: Duration::from_millis(100),
        });
        // With no exponential component the spacing alone drives the delays
        assert_eq!(limiter.next_delay(&"a"), Duration::ZERO);
        assert_eq!(limiter.next_delay(&"b"), Duration::from_millis(100));
        assert_eq!(limiter.next_delay(&"c"), Duration::from_millis(200));
    }
}
