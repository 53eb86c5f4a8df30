//! Rate limits for calling cloud OCR APIs.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// Convert this period to a [`Duration`].
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit for an API, such as "10/s".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period. Never zero.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Time between two refills of a single request.
    pub fn refill_interval(&self) -> Duration {
        let max_requests = u32::try_from(self.max_requests.max(1)).unwrap_or(u32::MAX);
        (self.per_period.to_duration() / max_requests).max(Duration::from_millis(1))
    }

    /// Create a [`RateLimiter`] for this rate limit.
    ///
    /// The bucket starts full and refills one request at a time, so a burst of
    /// `max_requests` is allowed up front and after that requests are spread
    /// evenly over the period.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(1)
            .max(self.max_requests)
            .interval(self.refill_interval())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("Missing period"))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("Rate limit must allow at least one request"));
            }
            Ok(Self {
                max_requests,
                per_period: per_period.trim().parse::<RateLimitPeriod>()?,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
