//! Token bucket admission control for inbound stanzas.
//!
//! Every stream session owns one bucket backed by a `governor` direct rate
//! limiter. Each stanza costs one token. A bucket holds at most `capacity`
//! tokens and earns `refill` tokens per `interval`, one every
//! `interval / refill`.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::middleware::NoOpMiddleware;
use governor::{Quota, RateLimiter};

/// Default bucket capacity.
pub const DEFAULT_CAPACITY: u32 = 100;

/// Default tokens restored per interval.
pub const DEFAULT_REFILL: u32 = 10;

/// Default refill interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Token bucket rate limiter.
///
/// A failed [`take`](Self::take) debits nothing. A zero capacity admits
/// nothing; a zero refill is treated as one.
pub struct TokenBucket<C: Clock = DefaultClock> {
    capacity: u32,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>>,
}

impl TokenBucket {
    /// Create a full bucket on the system clock.
    pub fn new(capacity: u32, refill: u32, interval: Duration) -> Self {
        Self::with_clock(capacity, refill, interval, &DefaultClock::default())
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(capacity: u32, refill: u32, interval: Duration, clock: &C) -> Self {
        let limiter = NonZeroU32::new(capacity).map(|burst| {
            let period = (interval / refill.max(1)).max(Duration::from_nanos(1));
            // period is non-zero, so the quota always exists
            let quota = Quota::with_period(period)
                .unwrap_or_else(|| Quota::per_second(burst))
                .allow_burst(burst);
            RateLimiter::direct_with_clock(quota, clock)
        });
        Self { capacity, limiter }
    }

    /// Try to take `n` tokens.
    ///
    /// Taking zero tokens always succeeds. Asking for more than the capacity
    /// always fails.
    pub fn take(&self, n: u32) -> bool {
        let Some(n) = NonZeroU32::new(n) else {
            return true;
        };
        match &self.limiter {
            Some(limiter) => matches!(limiter.check_n(n), Ok(Ok(_))),
            None => false,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL, DEFAULT_INTERVAL)
    }
}

impl<C: Clock> fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
