//! Sliding-window rate limiting per (identity, bucket).
//!
//! The window is a log of admission timestamps: entries older than the
//! bucket window are dropped before each check, so counters only ever hold
//! events inside the window. Updates to one key are serialized; keys are
//! independent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::RateLimitConfig;
use crate::model::Tier;

/// Named admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// General API requests.
    Api,
    /// File uploads.
    Files,
    /// Webhook management operations.
    Webhook,
    /// Admin endpoints; the role check is a prerequisite elsewhere.
    Admin,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Api => "api",
            Bucket::Files => "files",
            Bucket::Webhook => "webhook",
            Bucket::Admin => "admin",
        }
    }
}

const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Quota table: (limit, window) per tier and bucket.
pub fn quota(tier: Tier, bucket: Bucket) -> (u32, Duration) {
    match bucket {
        Bucket::Api => match tier {
            Tier::Free => (100, FIFTEEN_MIN),
            Tier::Pro => (1_000, FIFTEEN_MIN),
            Tier::Enterprise => (10_000, FIFTEEN_MIN),
        },
        Bucket::Files => match tier {
            Tier::Free => (10, ONE_DAY),
            Tier::Pro => (100, ONE_DAY),
            Tier::Enterprise => (1_000, ONE_DAY),
        },
        // Fixed across tiers.
        Bucket::Webhook => (100, ONE_HOUR),
        Bucket::Admin => (1_000, FIFTEEN_MIN),
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest in-window admission falls out of the window.
    pub reset: DateTime<Utc>,
    /// Set on denial: how long until a retry can succeed.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Header values for `X-RateLimit-Limit` / `-Remaining` / `-Reset`
    /// (reset is epoch milliseconds).
    pub fn header_values(&self) -> (String, String, String) {
        (
            self.limit.to_string(),
            self.remaining.to_string(),
            self.reset.timestamp_millis().to_string(),
        )
    }

    /// Structured 429 body.
    pub fn denial_body(&self) -> DenialBody {
        DenialBody {
            success: false,
            code: crate::error::code::RATE_LIMIT_EXCEEDED,
            details: DenialDetails {
                limit: self.limit,
                remaining: 0,
                reset: self.reset.timestamp_millis(),
                retry_after: self.retry_after.map(|d| d.as_secs()).unwrap_or(0),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DenialBody {
    pub success: bool,
    pub code: &'static str,
    pub details: DenialDetails,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialDetails {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds.
    pub reset: i64,
    /// Seconds.
    pub retry_after: u64,
}

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {} per window, retry after {:?}", .0.limit, .0.retry_after)]
    Denied(RateLimitDecision),
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Checks and records one admission for `identity` in `bucket`.
    pub fn check(
        &self,
        identity: &str,
        bucket: Bucket,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let (limit, window) = quota(tier, bucket);
        let window_chrono = chrono::Duration::from_std(window).unwrap_or_default();

        if !self.config.enabled {
            return allowed_decision(limit, limit, now + window_chrono);
        }

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Backend unavailable. Fail-open admits and warns; operators
                // can opt into fail-closed.
                return self.backend_unavailable(limit, now + window_chrono);
            }
        };

        let key = format!("{}:{}", identity, bucket.as_str());
        let log = windows.entry(key.clone()).or_default();

        let cutoff = now - window_chrono;
        while log.front().is_some_and(|&t| t < cutoff) {
            log.pop_front();
        }

        if (log.len() as u32) < limit {
            log.push_back(now);
            let oldest = *log.front().expect("just pushed");
            RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit - log.len() as u32,
                reset: oldest + window_chrono,
                retry_after: None,
            }
        } else {
            let oldest = *log.front().expect("len >= limit >= 1");
            let reset = oldest + window_chrono;
            let retry_after = (reset - now).to_std().unwrap_or(Duration::ZERO);
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset,
                retry_after: Some(retry_after),
            }
        }
    }

    /// Drops keys whose entire log has expired.
    pub fn reap(&self, now: DateTime<Utc>) {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // The longest window bounds how stale an entry can be and still
        // matter.
        let cutoff = now - chrono::Duration::from_std(ONE_DAY).unwrap_or_default();
        windows.retain(|_, log| log.back().is_some_and(|&t| t >= cutoff));
    }

    /// Number of live keys, for operational visibility.
    pub fn key_count(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn backend_unavailable(&self, limit: u32, reset: DateTime<Utc>) -> RateLimitDecision {
        if self.config.fail_open {
            log::warn!("rate limiter backend unavailable, admitting (fail-open)");
            allowed_decision(limit, limit, reset)
        } else {
            log::warn!("rate limiter backend unavailable, denying (fail-closed)");
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset,
                retry_after: Some(Duration::from_secs(1)),
            }
        }
    }
}

fn allowed_decision(limit: u32, remaining: u32, reset: DateTime<Utc>) -> RateLimitDecision {
    RateLimitDecision {
        allowed: true,
        limit,
        remaining,
        reset,
        retry_after: None,
    }
}
