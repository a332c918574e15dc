//! Rate limit policies and their identity keys.

use std::fmt;

use serde::Serialize;

use super::rate::AllowedConsumptionRate;
use crate::error::{FloodgateError, Result};

/// Matches any request key, route or method.
pub const WILDCARD: &str = "*";

/// Normalize a route template: `*` for empty, otherwise lowercased with a leading slash.
pub fn normalize_route(route: &str) -> String {
    let route = route.trim();
    if route.is_empty() || route == WILDCARD {
        return WILDCARD.to_string();
    }
    let lowered = route.to_lowercase();
    if lowered.starts_with('/') {
        lowered
    } else {
        format!("/{}", lowered)
    }
}

/// Normalize an HTTP method: `*` for empty, otherwise uppercased.
pub fn normalize_method(method: &str) -> String {
    let method = method.trim();
    if method.is_empty() {
        WILDCARD.to_string()
    } else {
        method.to_uppercase()
    }
}

/// The normalized `(request key, route, method)` triple identifying a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub request_key: String,
    pub route_template: String,
    pub http_method: String,
}

impl PolicyKey {
    pub fn new(request_key: &str, route_template: &str, http_method: &str) -> Self {
        Self {
            request_key: request_key.to_string(),
            route_template: normalize_route(route_template),
            http_method: normalize_method(http_method),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}",
            self.request_key, self.http_method, self.route_template
        )
    }
}

/// The bounds applied to a client/route/method triple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitPolicy {
    request_key: String,
    route_template: String,
    http_method: String,
    rates: Vec<AllowedConsumptionRate>,
    allow_attribute_override: bool,
    name: String,
}

impl RateLimitPolicy {
    /// Create a policy. Empty route templates and methods become `*`.
    pub fn new(
        request_key: impl Into<String>,
        route_template: &str,
        http_method: &str,
        rates: Vec<AllowedConsumptionRate>,
        allow_attribute_override: bool,
        name: impl Into<String>,
    ) -> Result<Self> {
        let request_key = request_key.into();
        if request_key.trim().is_empty() {
            return Err(FloodgateError::InvalidPolicy(
                "request key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            request_key,
            route_template: normalize_route(route_template),
            http_method: normalize_method(http_method),
            rates,
            allow_attribute_override,
            name: name.into(),
        })
    }

    /// A policy naming only the request key, with no rates of its own.
    ///
    /// Dynamic providers return these when the static table should decide.
    pub fn for_request_key(
        request_key: impl Into<String>,
        route_template: &str,
        http_method: &str,
    ) -> Result<Self> {
        Self::new(request_key, route_template, http_method, Vec::new(), true, "")
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            request_key: self.request_key.clone(),
            route_template: self.route_template.clone(),
            http_method: self.http_method.clone(),
        }
    }

    pub fn request_key(&self) -> &str {
        &self.request_key
    }

    pub fn route_template(&self) -> &str {
        &self.route_template
    }

    pub fn http_method(&self) -> &str {
        &self.http_method
    }

    pub fn rates(&self) -> &[AllowedConsumptionRate] {
        &self.rates
    }

    pub fn allow_attribute_override(&self) -> bool {
        self.allow_attribute_override
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Keep this policy's request key but take everything else from `matched`.
    pub(crate) fn adopt(&self, matched: &RateLimitPolicy) -> RateLimitPolicy {
        RateLimitPolicy {
            request_key: self.request_key.clone(),
            route_template: matched.route_template.clone(),
            http_method: matched.http_method.clone(),
            rates: matched.rates.clone(),
            allow_attribute_override: matched.allow_attribute_override,
            name: matched.name.clone(),
        }
    }
}

/// Rates attached to the endpoint itself (e.g. a route attribute), used in
/// place of the policy's rates when the policy allows overrides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RateOverride {
    pub route_template: String,
    pub http_method: String,
    pub rates: Vec<AllowedConsumptionRate>,
    pub name: String,
}
