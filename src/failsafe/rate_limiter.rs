//! Rate limiting for the credential endpoint

use std::num::NonZeroU32;

use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::config::RateLimitConfig;

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Request throttle for `POST /realtime/client_secret`
pub struct RateLimiter {
    inner: Option<DirectLimiter>,
}

impl RateLimiter {
    /// Create a rate limiter. Disabled configuration yields a pass-through.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let inner = config.enabled.then(|| {
            let quota = Quota::per_second(
                NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
            )
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));
            GovernorLimiter::direct(quota)
        });
        Self { inner }
    }

    /// Try to acquire a permit
    pub fn try_acquire(&self) -> bool {
        match &self.inner {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }
}
