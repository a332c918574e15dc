//! Rate limiter orchestrator.
//!
//! Ties policy resolution to a [`LimitBackend`]: resolve the policy, pick the
//! effective rates, apply whitelists and delegate the counting.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::backend::LimitBackend;
use super::policy::{RateLimitPolicy, RateOverride};
use super::request::RequestDescriptor;
use super::resolver::PolicyResolver;
use super::result::RateLimitingResult;
use crate::error::Result;

/// The entry point adapters call for every request.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    backend: Arc<dyn LimitBackend>,
    resolver: Arc<PolicyResolver>,
    whitelisted_request_keys: Vec<String>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("resolver", &self.resolver)
            .field("whitelisted_request_keys", &self.whitelisted_request_keys)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn LimitBackend>, resolver: Arc<PolicyResolver>) -> Self {
        Self {
            backend,
            resolver,
            whitelisted_request_keys: Vec::new(),
        }
    }

    /// Exempt these request keys from every policy (case-insensitive).
    pub fn with_whitelisted_request_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelisted_request_keys
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn resolver(&self) -> &Arc<PolicyResolver> {
        &self.resolver
    }

    pub fn is_whitelisted_key(&self, request_key: &str) -> bool {
        self.whitelisted_request_keys
            .iter()
            .any(|k| k.eq_ignore_ascii_case(request_key))
    }

    /// Decide whether `request` may proceed.
    ///
    /// `attribute_rates` supplies rates attached to the endpoint itself; it is
    /// only consulted when the resolved policy allows overrides.
    ///
    /// # Errors
    /// Only configuration problems are returned as errors; an unavailable
    /// store yields [`LimitState::LimitApplicationFailed`].
    ///
    /// [`LimitState::LimitApplicationFailed`]: super::LimitState::LimitApplicationFailed
    pub async fn limit_request<F>(
        &self,
        request: &RequestDescriptor,
        host: &str,
        attribute_rates: F,
    ) -> Result<RateLimitingResult>
    where
        F: FnOnce() -> Option<RateOverride> + Send,
    {
        let policy = self.resolver.get_policy(request).await;
        self.limit_with_policy(policy, host, attribute_rates).await
    }

    /// Like [`limit_request`](Self::limit_request) with an already resolved policy.
    pub async fn limit_with_policy<F>(
        &self,
        policy: Option<RateLimitPolicy>,
        host: &str,
        attribute_rates: F,
    ) -> Result<RateLimitingResult>
    where
        F: FnOnce() -> Option<RateOverride> + Send,
    {
        let Some(policy) = policy else {
            return Ok(RateLimitingResult::not_applicable());
        };

        let overridden = if policy.allow_attribute_override() {
            attribute_rates().filter(|o| !o.rates.is_empty())
        } else {
            None
        };
        let (route, method, rates, name) = match &overridden {
            Some(o) => (
                non_empty_or(&o.route_template, policy.route_template()),
                non_empty_or(&o.http_method, policy.http_method()),
                o.rates.as_slice(),
                non_empty_or(&o.name, policy.name()),
            ),
            None => (
                policy.route_template(),
                policy.http_method(),
                policy.rates(),
                policy.name(),
            ),
        };

        if rates.is_empty() {
            trace!(request_key = %policy.request_key(), "Policy has no rates");
            return Ok(RateLimitingResult::not_applicable());
        }

        let request_key = policy.request_key();
        if self.is_whitelisted_key(request_key) || rates.iter().any(|r| r.is_whitelisted(request_key))
        {
            trace!(request_key = %request_key, "Request key is whitelisted");
            return Ok(RateLimitingResult::not_applicable());
        }

        let cost = rates.iter().map(|r| r.cost_per_call()).max().unwrap_or(1);
        let result = self
            .backend
            .limit_request(request_key, method, host, route, rates, cost)
            .await?;

        if result.state.is_throttled() {
            debug!(
                request_key = %request_key,
                policy = %name,
                retry_after_secs = result.retry_after_secs(),
                "Request throttled"
            );
            return Ok(result.with_policy_name(name));
        }
        Ok(result)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
