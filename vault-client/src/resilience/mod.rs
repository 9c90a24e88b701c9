//! Resilience layer: shared rate limiting and bounded retries.
//!
//! - [`RateLimiter`] - one admission window shared by every outbound request
//! - [`with_backoff`] - retry combinator driven by an error classifier
//!
//! The schedules and admission rules live in `keyrelay-core`; this module
//! adds the clock and the sleeping.

mod backoff;
mod rate_limit;

pub use backoff::{retry, with_backoff, RetryOutcome};
pub use rate_limit::RateLimiter;
