//! Fixed-window rate limiting keyed by `action:identifier`.
//!
//! Counters are process-local, in-memory state owned by an explicit
//! [`RateLimiter`] instance that is constructed once and passed by handle —
//! never a module-level singleton — so tests can run independent limiters.
//!
//! A window is lazily reset: once `reset_at` has passed, the next request for
//! that key starts a fresh window regardless of the prior outcome, even if
//! the sweeper has not discarded the entry yet. Sweeping only bounds memory;
//! it is never relied on for correctness.

use crate::clock::Clock;
use crate::error::AuthError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub name: &'static str,
    pub max_requests: u32,
    pub window_secs: i64,
}

/// Structured outcome of a limit check. `error` carries the human-readable
/// retry message only when the request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub reset_in_secs: i64,
    pub error: Option<String>,
}

impl RateLimitDecision {
    /// Convert a denial into the crate error; allowed decisions pass.
    ///
    /// # Errors
    /// `RateLimited` with the retry-after countdown when denied.
    pub fn into_result(self) -> Result<Self, AuthError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(AuthError::RateLimited {
                retry_after_secs: self.reset_in_secs,
            })
        }
    }
}

struct Entry {
    count: u32,
    reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `identifier` under the named policy.
    /// Increment-and-compare happens under a single lock, so concurrent
    /// requests cannot lose updates and exceed the ceiling.
    pub fn check(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = self.clock.now();
        let key = format!("{}:{identifier}", config.name);
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

        let entry = entries.entry(key).or_insert(Entry {
            count: 0,
            reset_at: now,
        });
        if now >= entry.reset_at {
            // Fresh window, whether the key is new or lazily expired.
            entry.count = 0;
            entry.reset_at = now + chrono::Duration::seconds(config.window_secs);
        }
        entry.count += 1;

        let reset_in_secs = seconds_until(entry.reset_at, now);
        if entry.count > config.max_requests {
            warn!(
                action = config.name,
                %identifier,
                count = entry.count,
                "rate limit exceeded"
            );
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                limit: config.max_requests,
                reset_in_secs,
                error: Some(format!(
                    "Too many requests. Please try again in {reset_in_secs} seconds"
                )),
            };
        }

        RateLimitDecision {
            allowed: true,
            remaining: config.max_requests - entry.count,
            limit: config.max_requests,
            reset_in_secs,
            error: None,
        }
    }

    /// Discard entries whose window has elapsed. Returns how many were
    /// removed. Memory management only.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.reset_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "swept expired rate-limit entries");
        }
        removed
    }

    /// Number of tracked keys; exposed for sweeper tests and metrics.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    /// Run [`Self::sweep`] on an interval until the limiter is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.sweep();
            }
        })
    }
}

fn seconds_until(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (reset_at - now).num_milliseconds().max(0);
    (millis + 999) / 1000
}

/// Named policies used across the application. Configuration, not structure:
/// any (name, max, window) triple is a valid config.
pub mod policies {
    use super::RateLimitConfig;

    #[must_use]
    pub fn login() -> RateLimitConfig {
        RateLimitConfig {
            name: "login",
            max_requests: 5,
            window_secs: 15 * 60,
        }
    }

    #[must_use]
    pub fn password_reset() -> RateLimitConfig {
        RateLimitConfig {
            name: "password-reset",
            max_requests: 3,
            window_secs: 60 * 60,
        }
    }

    #[must_use]
    pub fn sms_send() -> RateLimitConfig {
        RateLimitConfig {
            name: "sms-send",
            max_requests: 5,
            window_secs: 60 * 60,
        }
    }

    #[must_use]
    pub fn email_verify() -> RateLimitConfig {
        RateLimitConfig {
            name: "email-verify",
            max_requests: 5,
            window_secs: 60 * 60,
        }
    }

    #[must_use]
    pub fn webauthn_register() -> RateLimitConfig {
        RateLimitConfig {
            name: "webauthn-register",
            max_requests: 10,
            window_secs: 60 * 60,
        }
    }

    #[must_use]
    pub fn general_api() -> RateLimitConfig {
        RateLimitConfig {
            name: "general-api",
            max_requests: 100,
            window_secs: 15 * 60,
        }
    }
}
