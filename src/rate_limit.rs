//! Rate limits for remote APIs, written as `10/s`, `500/m` or `1000/h`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which a [`RateLimit`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
    Hour,
}

impl RateLimitPeriod {
    /// The length of this period.
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
            RateLimitPeriod::Hour => write!(f, "h"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            "h" => Ok(RateLimitPeriod::Hour),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// How often should we add one more request to the bucket?
    fn refill_interval(&self) -> Duration {
        let max_requests = u32::try_from(self.max_requests).unwrap_or(u32::MAX);
        (self.per_period.to_duration() / max_requests).max(Duration::from_millis(1))
    }

    /// Create a [`RateLimiter`] enforcing this limit.
    ///
    /// The bucket starts full, so a short burst of `max_requests` goes through
    /// immediately. After that, requests trickle in evenly across the period.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.max_requests)
            .max(self.max_requests)
            .refill(1)
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
                .ok_or_else(|| anyhow!("expected a value like \"10/s\""))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least one request"));
            }
            Ok(Self {
                max_requests,
                per_period: per_period.trim().parse()?,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let rate_limit = RateLimit::from_str("10/s").unwrap();
        assert_eq!(rate_limit.max_requests, 10);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Second);

        let rate_limit = RateLimit::from_str("1000/h").unwrap();
        assert_eq!(rate_limit.max_requests, 1000);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Hour);
    }

    #[test]
    fn test_failed_parse() {
        for input in ["10/invalid", "invalid", "0/s", "-1/s", "10", "/m"] {
            assert!(RateLimit::from_str(input).is_err(), "{input:?} parsed");
        }
    }

    #[test]
    fn test_display_round_trips() {
        for input in ["10/s", "5/m", "1000/h"] {
            assert_eq!(RateLimit::from_str(input).unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_refill_interval() {
        let rate_limit = RateLimit::from_str("60/m").unwrap();
        assert_eq!(rate_limit.refill_interval(), Duration::from_secs(1));

        // Very high limits still refill at a sane pace.
        let rate_limit = RateLimit::from_str("1000000/s").unwrap();
        assert_eq!(rate_limit.refill_interval(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_initial_burst() {
        let limiter = RateLimit::from_str("3/h").unwrap().to_rate_limiter();
        for _ in 0..3 {
            assert!(limiter.try_acquire(1));
        }
        assert!(!limiter.try_acquire(1));
    }
}
