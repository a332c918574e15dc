//! Store lookup keys for rate counters.

use std::fmt;
use std::time::Duration;

use super::policy::{normalize_method, normalize_route};
use super::rate::{AllowedConsumptionRate, RateUnit};

/// A key that names one counter record in the backing store.
///
/// Built fresh for each evaluation. The string form is
/// `requestId::METHOD host/route::suffix`, where the suffix is chosen by the
/// window algorithm (a time bucket, a unit name, or a period descriptor).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitCacheKey {
    /// The client identity the counter belongs to
    pub request_id: String,
    /// Normalized HTTP method
    pub method: String,
    /// Host the request was addressed to
    pub host: String,
    /// Normalized route template
    pub route_template: String,
    /// The rate this counter enforces
    pub rate: AllowedConsumptionRate,
    /// Algorithm-specific bucket suffix
    pub suffix: String,
    /// How long the store record should live
    pub expiration: Duration,
}

impl RateLimitCacheKey {
    pub fn new(
        request_id: &str,
        method: &str,
        host: &str,
        route_template: &str,
        rate: &AllowedConsumptionRate,
        suffix: impl Into<String>,
        expiration: Duration,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            method: normalize_method(method),
            host: host.to_string(),
            route_template: normalize_route(route_template),
            rate: rate.clone(),
            suffix: suffix.into(),
            expiration,
        }
    }

    pub fn limit(&self) -> i64 {
        self.rate.limit()
    }

    pub fn unit(&self) -> RateUnit {
        self.rate.unit()
    }

    /// Convert the cache key to the string stored in the backing store.
    pub fn to_string_key(&self) -> String {
        let route = self.route_template.trim_start_matches('/');
        format!(
            "{}::{} {}/{}::{}",
            self.request_id, self.method, self.host, route, self.suffix
        )
    }
}

impl fmt::Display for RateLimitCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
