//! Shared request budget built on governor.
//!
//! Two direct limiters are checked in turn: a window quota of
//! `max_per_window` requests per `window` (all of them usable as a burst),
//! then a spacing quota of one request per `min_spacing`.

use crate::config::RateLimitConfig;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Reads time from the tokio runtime, so paused test clocks drive the quotas.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type DirectLimiter = governor::RateLimiter<
    NotKeyed,
    InMemoryState,
    TokioClock,
    NoOpMiddleware<std::time::Instant>,
>;

/// Cloneable handle to one shared request budget.
///
/// Every clone draws from the same quotas, so a single limiter passed to the
/// pool throttles publishes and queries for all relays and all records
/// together.
#[derive(Clone)]
pub struct RateLimiter {
    window: Option<Arc<DirectLimiter>>,
    spacing: Option<Arc<DirectLimiter>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window.as_ref().map(|_| "DirectLimiter"))
            .field("spacing", &self.spacing.as_ref().map(|_| "DirectLimiter"))
            .finish()
    }
}

impl RateLimiter {
    /// Limit to `max_per_window` requests per `window`, at least
    /// `min_spacing` apart.
    ///
    /// A zero `window` or `min_spacing` disables that quota.
    pub fn new(max_per_window: u32, window: Duration, min_spacing: Duration) -> Self {
        let burst = NonZeroU32::new(max_per_window).unwrap_or(NonZeroU32::MIN);
        let window = Quota::with_period(window / burst.get())
            .map(|quota| quota.allow_burst(burst))
            .map(|quota| Arc::new(DirectLimiter::direct_with_clock(quota, TokioClock)));
        let spacing = Quota::with_period(min_spacing)
            .map(|quota| Arc::new(DirectLimiter::direct_with_clock(quota, TokioClock)));
        Self { window, spacing }
    }

    /// A limiter that never makes anyone wait.
    pub fn unlimited() -> Self {
        Self {
            window: None,
            spacing: None,
        }
    }

    /// Build from the `[rate_limit]` config section.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_per_window,
            Duration::from_millis(config.window_ms),
            Duration::from_millis(config.min_spacing_ms),
        )
    }

    /// Wait until a request may be sent. Never fails.
    pub async fn wait_for_slot(&self) {
        if let Some(window) = &self.window {
            admit(window).await;
        }
        if let Some(spacing) = &self.spacing {
            admit(spacing).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

async fn admit(limiter: &DirectLimiter) {
    while let Err(not_until) = limiter.check() {
        let delay = not_until.wait_time_from(TokioClock.now());
        tracing::trace!("Rate limited, waiting {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}
