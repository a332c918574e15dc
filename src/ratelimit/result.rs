//! The outcome of one admission decision.

use serde::Serialize;

use super::cache_key::RateLimitCacheKey;
use crate::clock::Ticks;

/// HTTP status adapters should answer throttled requests with.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Decision reached for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimitState {
    /// Admitted; counters were incremented
    Success,
    /// Rejected; counters were rolled back
    Throttled,
    /// No policy or rate applies, or the key is whitelisted
    NotApplicable,
    /// The store could not be consulted; the request proceeds unthrottled
    LimitApplicationFailed,
    /// Rejected, but rolling the counters back failed
    ThrottledButCompensationFailed,
}

impl LimitState {
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            LimitState::Throttled | LimitState::ThrottledButCompensationFailed
        )
    }
}

/// Result of a rate limiting evaluation.
///
/// For throttled results `cache_key` names the violated counter. For
/// successful ones it names the counter with the least headroom.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitingResult {
    pub state: LimitState,
    /// How long the client should wait before retrying, in ticks (milliseconds)
    pub waiting_interval_ticks: Ticks,
    pub cache_key: Option<RateLimitCacheKey>,
    pub remaining: i64,
    pub violated_policy_name: String,
}

impl RateLimitingResult {
    fn with_state(state: LimitState) -> Self {
        Self {
            state,
            waiting_interval_ticks: 0,
            cache_key: None,
            remaining: 0,
            violated_policy_name: String::new(),
        }
    }

    pub fn not_applicable() -> Self {
        Self::with_state(LimitState::NotApplicable)
    }

    pub fn limit_application_failed() -> Self {
        Self::with_state(LimitState::LimitApplicationFailed)
    }

    pub fn success(remaining: i64, cache_key: Option<RateLimitCacheKey>) -> Self {
        Self {
            remaining,
            cache_key,
            ..Self::with_state(LimitState::Success)
        }
    }

    pub fn throttled(
        state: LimitState,
        waiting_interval_ticks: Ticks,
        cache_key: RateLimitCacheKey,
        remaining: i64,
    ) -> Self {
        Self {
            state,
            waiting_interval_ticks: waiting_interval_ticks.max(0),
            cache_key: Some(cache_key),
            remaining,
            violated_policy_name: String::new(),
        }
    }

    pub fn with_policy_name(mut self, name: impl Into<String>) -> Self {
        self.violated_policy_name = name.into();
        self
    }

    /// Whole seconds until a retry can succeed, rounded up.
    ///
    /// Throttled results always report at least one second.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = (self.waiting_interval_ticks.max(0) as u64).div_ceil(1000);
        if self.state.is_throttled() {
            secs.max(1)
        } else {
            secs
        }
    }

    /// Status code an HTTP adapter should return, `None` to let the request proceed.
    pub fn status_code(&self) -> Option<u16> {
        self.state.is_throttled().then_some(TOO_MANY_REQUESTS)
    }

    /// Headers an HTTP adapter should attach to the response.
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        match self.state {
            LimitState::Throttled | LimitState::ThrottledButCompensationFailed => {
                let mut headers = vec![("Retry-After", self.retry_after_secs().to_string())];
                if !self.violated_policy_name.is_empty() {
                    headers.push(("X-RateLimit-Policy", self.violated_policy_name.clone()));
                }
                if let Some(key) = &self.cache_key {
                    headers.push(("X-RateLimit-Violated-Rate", key.rate.to_string()));
                }
                headers
            }
            LimitState::Success => match &self.cache_key {
                Some(key) => vec![
                    ("X-RateLimit-Remaining", self.remaining.max(0).to_string()),
                    ("X-RateLimit-Limit", key.rate.to_string()),
                ],
                None => Vec::new(),
            },
            LimitState::NotApplicable | LimitState::LimitApplicationFailed => Vec::new(),
        }
    }
}
