//! Policy model, policy resolution and the rate limiting orchestrator.

mod backend;
mod cache_key;
mod limiter;
mod policy;
mod rate;
mod request;
mod resolver;
mod result;
pub mod rules;

pub use backend::LimitBackend;
pub use cache_key::RateLimitCacheKey;
pub use limiter::RateLimiter;
pub use policy::{normalize_method, normalize_route, PolicyKey, RateLimitPolicy, RateOverride, WILDCARD};
pub use rate::{AllowedConsumptionRate, LimitPeriod, RateUnit};
pub use request::{ClientIdPolicyProvider, IpAddressPolicyProvider, PolicyProvider, RequestDescriptor};
pub use resolver::PolicyResolver;
pub use result::{LimitState, RateLimitingResult, TOO_MANY_REQUESTS};
