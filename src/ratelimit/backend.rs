//! Backing-store adapter boundary used by the orchestrator.

use async_trait::async_trait;

use super::{AllowedConsumptionRate, RateLimitingResult};
use crate::error::Result;

/// Evaluates a set of rates for one request against shared state.
///
/// This trait abstracts over the window algorithms so the orchestrator can
/// work with any of them (or with a test double).
#[async_trait]
pub trait LimitBackend: Send + Sync {
    /// Count one call of `cost_per_call` units against every rate.
    ///
    /// Store failures are reported through the result state; only
    /// configuration problems (such as a rate the algorithm cannot enforce)
    /// are returned as errors.
    async fn limit_request(
        &self,
        request_id: &str,
        method: &str,
        host: &str,
        route_template: &str,
        rates: &[AllowedConsumptionRate],
        cost_per_call: i64,
    ) -> Result<RateLimitingResult>;
}
