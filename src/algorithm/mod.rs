//! Window algorithms and the shared evaluation procedure.
//!
//! A [`WindowAlgorithm`] decides how a rate maps onto store records: which
//! bucket a call falls into, which commands count it, how to undo them, and
//! where to find the oldest observation. [`WindowRateLimiter`] runs the same
//! procedure for every algorithm:
//!
//! 1. resolve a bucket for every rate (out-of-period custom rates make the
//!    whole call not applicable),
//! 2. count the call against every rate in one atomic transaction,
//! 3. compare each observed count with the rate's capacity,
//! 4. on violation, roll every increment back in a second transaction and
//!    work out how long the client has to wait.

pub mod fixed;
pub mod leaky_bucket;
pub mod sliding;
pub mod stepping;

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::clock::{Clock, Ticks};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{
    AllowedConsumptionRate, LimitBackend, LimitState, RateLimitCacheKey, RateLimitingResult,
};
use crate::store::{reply_at, Reply, Store, StoreError, Transaction};

pub use fixed::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding::SlidingWindow;
pub use stepping::SteppingWindow;

/// The time bucket a rate is counted in for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Suffix appended to the cache key
    pub suffix: String,
    /// Start of the bucket, used when the oldest observation is unknown
    pub start: Ticks,
    /// Window length used for waiting-interval math
    pub length: Ticks,
    /// TTL for the store record
    pub expiration: Duration,
}

/// Strategy that turns a rate into store commands.
pub trait WindowAlgorithm: Send + Sync + fmt::Debug {
    fn kind(&self) -> AlgorithmKind;

    /// The bucket `rate` is counted in at `now`.
    ///
    /// Returns `Ok(None)` when a custom-period rate is outside its period, and
    /// an error when this algorithm cannot enforce the rate at all.
    fn bucket(&self, rate: &AllowedConsumptionRate, now: Ticks) -> Result<Option<Bucket>>;

    /// Queue the commands that count one call. Returns the index of the reply
    /// holding the observed count.
    fn stage_apply(
        &self,
        tx: &mut Transaction,
        key: &RateLimitCacheKey,
        bucket: &Bucket,
        cost: i64,
        now: Ticks,
        call_id: &str,
    ) -> usize;

    /// Queue the commands that undo [`stage_apply`](Self::stage_apply).
    fn stage_undo(&self, tx: &mut Transaction, key: &RateLimitCacheKey, cost: i64, call_id: &str);

    /// Queue a query for the oldest observation, if the algorithm stores one.
    fn stage_oldest(&self, _tx: &mut Transaction, _key: &RateLimitCacheKey) -> Option<usize> {
        None
    }

    /// Read the oldest observation from its reply, if there is one.
    fn oldest_observation(&self, _reply: Option<&Reply>, bucket: &Bucket) -> Ticks {
        bucket.start
    }

    /// Read the observed count from the reply named by `stage_apply`.
    fn observed_count(&self, reply: &Reply) -> std::result::Result<i64, StoreError> {
        reply.as_integer()
    }
}

/// Selects a window algorithm by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    Fixed,
    Stepping,
    Sliding,
    LeakyBucket,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::Fixed => "fixed",
            AlgorithmKind::Stepping => "stepping",
            AlgorithmKind::Sliding => "sliding",
            AlgorithmKind::LeakyBucket => "leaky_bucket",
        }
    }

    pub fn build(&self) -> Arc<dyn WindowAlgorithm> {
        match self {
            AlgorithmKind::Fixed => Arc::new(FixedWindow),
            AlgorithmKind::Stepping => Arc::new(SteppingWindow),
            AlgorithmKind::Sliding => Arc::new(SlidingWindow),
            AlgorithmKind::LeakyBucket => Arc::new(LeakyBucket),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed" | "fixed_window" => Ok(AlgorithmKind::Fixed),
            "stepping" | "stepping_window" => Ok(AlgorithmKind::Stepping),
            "sliding" | "sliding_window" => Ok(AlgorithmKind::Sliding),
            "leaky_bucket" | "token_bucket" => Ok(AlgorithmKind::LeakyBucket),
            other => Err(FloodgateError::Config(format!("unknown algorithm '{}'", other))),
        }
    }
}

/// One rate resolved for the current evaluation.
#[derive(Debug)]
struct StagedRate {
    key: RateLimitCacheKey,
    bucket: Bucket,
}

/// Evaluates rates against a shared store using one [`WindowAlgorithm`].
///
/// All store I/O runs inside the circuit breaker; a failing store yields
/// [`LimitState::LimitApplicationFailed`] rather than an error.
#[derive(Debug)]
pub struct WindowRateLimiter {
    algorithm: Arc<dyn WindowAlgorithm>,
    store: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    /// Keep increments of throttled calls instead of rolling them back
    count_throttled_requests: bool,
}

impl WindowRateLimiter {
    pub fn new(
        algorithm: Arc<dyn WindowAlgorithm>,
        store: Arc<dyn Store>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            algorithm,
            store,
            breaker,
            clock,
            count_throttled_requests: false,
        }
    }

    pub fn with_count_throttled_requests(mut self, count: bool) -> Self {
        self.count_throttled_requests = count;
        self
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm.kind()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn apply(
        &self,
        staged: &[StagedRate],
        cost: i64,
        now: Ticks,
    ) -> std::result::Result<RateLimitingResult, StoreError> {
        let call_id = Uuid::new_v4().to_string();

        let mut tx = Transaction::new();
        let slots: Vec<usize> = staged
            .iter()
            .map(|s| {
                self.algorithm
                    .stage_apply(&mut tx, &s.key, &s.bucket, cost, now, &call_id)
            })
            .collect();
        let replies = self.store.execute(tx).await?;

        let mut tightest: Option<(i64, usize)> = None;
        let mut violated: Vec<(usize, i64)> = Vec::new();
        for (index, (rate, slot)) in staged.iter().zip(&slots).enumerate() {
            let observed = self.algorithm.observed_count(reply_at(&replies, *slot)?)?;
            let remaining = rate.key.rate.capacity() - observed;

            trace!(
                key = %rate.key,
                observed = observed,
                remaining = remaining,
                "Observed rate consumption"
            );

            if tightest.map_or(true, |(r, _)| remaining < r) {
                tightest = Some((remaining, index));
            }
            if remaining < 0 {
                violated.push((index, remaining));
            }
        }

        // Negative costs are compensating calls and are never throttled.
        if violated.is_empty() || cost < 0 {
            return Ok(match tightest {
                Some((remaining, index)) => {
                    RateLimitingResult::success(remaining, Some(staged[index].key.clone()))
                }
                None => RateLimitingResult::not_applicable(),
            });
        }

        // Satisfying the coarsest violated window also satisfies the finer ones.
        let (worst, _) = violated
            .iter()
            .copied()
            .max_by_key(|(index, remaining)| (staged[*index].bucket.length, Reverse(*remaining)))
            .unwrap_or(violated[0]);
        let worst = &staged[worst];

        let mut undo = Transaction::new();
        if !self.count_throttled_requests {
            for rate in staged {
                self.algorithm.stage_undo(&mut undo, &rate.key, cost, &call_id);
            }
        }
        let oldest_slot = self.algorithm.stage_oldest(&mut undo, &worst.key);

        let (state, oldest) = if undo.is_empty() {
            (LimitState::Throttled, worst.bucket.start)
        } else {
            match self.store.execute(undo).await {
                Ok(replies) => {
                    let reply = oldest_slot.and_then(|slot| replies.get(slot));
                    (
                        LimitState::Throttled,
                        self.algorithm.oldest_observation(reply, &worst.bucket),
                    )
                }
                Err(e) => {
                    warn!(
                        key = %worst.key,
                        error = %e,
                        "Failed to roll back throttled request; counters stay inflated until expiry"
                    );
                    (LimitState::ThrottledButCompensationFailed, worst.bucket.start)
                }
            }
        };

        let waiting = oldest + worst.bucket.length - now;
        debug!(
            key = %worst.key,
            algorithm = %self.algorithm.kind(),
            waiting_ms = waiting,
            state = ?state,
            "Rate limit exceeded"
        );

        Ok(RateLimitingResult::throttled(
            state,
            waiting,
            worst.key.clone(),
            0,
        ))
    }
}

#[async_trait]
impl LimitBackend for WindowRateLimiter {
    async fn limit_request(
        &self,
        request_id: &str,
        method: &str,
        host: &str,
        route_template: &str,
        rates: &[AllowedConsumptionRate],
        cost_per_call: i64,
    ) -> Result<RateLimitingResult> {
        let now = self.clock.now_ticks();

        let mut staged = Vec::with_capacity(rates.len());
        for rate in rates {
            let Some(bucket) = self.algorithm.bucket(rate, now)? else {
                trace!(rate = %rate, "Custom period not active; request not counted");
                return Ok(RateLimitingResult::not_applicable());
            };
            let key = RateLimitCacheKey::new(
                request_id,
                method,
                host,
                route_template,
                rate,
                bucket.suffix.clone(),
                bucket.expiration,
            );
            staged.push(StagedRate { key, bucket });
        }

        if staged.is_empty() {
            return Ok(RateLimitingResult::not_applicable());
        }

        trace!(
            request_id = %request_id,
            algorithm = %self.algorithm.kind(),
            rates = staged.len(),
            cost = cost_per_call,
            "Evaluating rates"
        );

        let result = self
            .breaker
            .execute(
                || self.apply(&staged, cost_per_call, now),
                RateLimitingResult::limit_application_failed(),
            )
            .await;
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::ratelimit::RateUnit;
    use crate::store::testing::FlakyStore;
    use crate::store::InMemoryStore;

    /// 2026-10-17T11:00:00Z, aligned to every fixed unit up to an hour.
    pub(crate) const T0: Ticks = 1_792_234_800_000;

    pub(crate) struct Harness {
        pub limiter: WindowRateLimiter,
        pub clock: ManualClock,
        pub memory: Arc<InMemoryStore>,
        pub store: Arc<FlakyStore>,
    }

    pub(crate) fn harness(kind: AlgorithmKind) -> Harness {
        let clock = ManualClock::at_ticks(T0);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let memory = Arc::new(InMemoryStore::with_clock(shared_clock.clone()));
        let store = Arc::new(FlakyStore::new(memory.clone()));
        let breaker = Arc::new(CircuitBreaker::with_clock(
            CircuitBreakerConfig::default(),
            shared_clock.clone(),
        ));
        let limiter = WindowRateLimiter::new(kind.build(), store.clone(), breaker, shared_clock);
        Harness {
            limiter,
            clock,
            memory,
            store,
        }
    }

    pub(crate) fn rate(limit: i64, unit: RateUnit) -> AllowedConsumptionRate {
        AllowedConsumptionRate::new(limit, unit).unwrap()
    }

    pub(crate) async fn call(h: &Harness, rates: &[AllowedConsumptionRate]) -> RateLimitingResult {
        h.limiter
            .limit_request("clientA", "GET", "localhost", "/api/values", rates, 1)
            .await
            .unwrap()
    }

    const ALL: [AlgorithmKind; 4] = [
        AlgorithmKind::Fixed,
        AlgorithmKind::Stepping,
        AlgorithmKind::Sliding,
        AlgorithmKind::LeakyBucket,
    ];

    #[tokio::test]
    async fn test_limit_then_throttle_for_every_algorithm() {
        for kind in ALL {
            let h = harness(kind);
            let rates = [rate(3, RateUnit::PerMinute)];

            for expected in [2, 1, 0] {
                let result = call(&h, &rates).await;
                assert_eq!(result.state, LimitState::Success, "{}", kind);
                assert_eq!(result.remaining, expected, "{}", kind);
            }

            let result = call(&h, &rates).await;
            assert_eq!(result.state, LimitState::Throttled, "{}", kind);
            assert_eq!(result.cache_key.unwrap().rate, rates[0], "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_two_per_minute_scenario() {
        for kind in [AlgorithmKind::Fixed, AlgorithmKind::Sliding] {
            let h = harness(kind);
            let rates = [rate(2, RateUnit::PerMinute)];

            let r1 = call(&h, &rates).await;
            let r2 = call(&h, &rates).await;
            let r3 = call(&h, &rates).await;

            assert_eq!((r1.state, r1.remaining), (LimitState::Success, 1));
            assert_eq!((r2.state, r2.remaining), (LimitState::Success, 0));
            assert_eq!(r3.state, LimitState::Throttled);
            assert_eq!(r3.waiting_interval_ticks, 60_000, "{}", kind);
            assert_eq!(r3.retry_after_secs(), 60);
        }
    }

    #[tokio::test]
    async fn test_counter_resets_after_window() {
        for kind in ALL {
            let h = harness(kind);
            let rates = [rate(2, RateUnit::PerSecond)];

            call(&h, &rates).await;
            call(&h, &rates).await;
            assert_eq!(call(&h, &rates).await.state, LimitState::Throttled, "{}", kind);

            h.clock.advance(Duration::from_millis(1_001));
            assert_eq!(call(&h, &rates).await.state, LimitState::Success, "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_multi_rate_reports_finest_violated_rate() {
        for kind in ALL {
            let h = harness(kind);
            let per_second = rate(2, RateUnit::PerSecond);
            let per_minute = rate(10, RateUnit::PerMinute);
            let rates = [per_second.clone(), per_minute];

            assert_eq!(call(&h, &rates).await.state, LimitState::Success);
            assert_eq!(call(&h, &rates).await.state, LimitState::Success);
            let third = call(&h, &rates).await;

            assert_eq!(third.state, LimitState::Throttled, "{}", kind);
            assert_eq!(third.cache_key.unwrap().rate, per_second, "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_coarsest_violated_rate_wins() {
        let h = harness(AlgorithmKind::Fixed);
        let per_second = rate(1, RateUnit::PerSecond);
        let per_hour = rate(1, RateUnit::PerHour);
        let rates = [per_second, per_hour.clone()];

        call(&h, &rates).await;
        let result = call(&h, &rates).await;

        assert_eq!(result.state, LimitState::Throttled);
        assert_eq!(result.cache_key.unwrap().rate, per_hour);
        assert_eq!(result.waiting_interval_ticks, 3_600_000);
    }

    #[tokio::test]
    async fn test_success_reports_tightest_rate() {
        let h = harness(AlgorithmKind::Fixed);
        let loose = rate(100, RateUnit::PerMinute);
        let tight = rate(5, RateUnit::PerHour);

        let result = call(&h, &[loose, tight.clone()]).await;
        assert_eq!(result.state, LimitState::Success);
        assert_eq!(result.remaining, 4);
        assert_eq!(result.cache_key.unwrap().rate, tight);
    }

    #[tokio::test]
    async fn test_throttled_call_is_rolled_back() {
        let h = harness(AlgorithmKind::Fixed);
        let rates = [rate(2, RateUnit::PerMinute)];

        call(&h, &rates).await;
        let second = call(&h, &rates).await;
        let key = second.cache_key.unwrap().to_string_key();
        let before = h.memory.counter(&key);

        let third = call(&h, &rates).await;
        assert_eq!(third.state, LimitState::Throttled);
        assert_eq!(h.memory.counter(&key), before);
    }

    #[tokio::test]
    async fn test_counting_throttled_requests_keeps_increment() {
        let h = harness(AlgorithmKind::Fixed);
        let limiter = WindowRateLimiter {
            count_throttled_requests: true,
            ..h.limiter
        };
        let rates = [rate(1, RateUnit::PerMinute)];

        let first = limiter
            .limit_request("c", "GET", "h", "/r", &rates, 1)
            .await
            .unwrap();
        let key = first.cache_key.unwrap().to_string_key();
        let second = limiter
            .limit_request("c", "GET", "h", "/r", &rates, 1)
            .await
            .unwrap();

        assert_eq!(second.state, LimitState::Throttled);
        assert_eq!(h.memory.counter(&key), Some(2));
    }

    #[tokio::test]
    async fn test_negative_cost_is_never_throttled() {
        let h = harness(AlgorithmKind::Fixed);
        let rates = [rate(1, RateUnit::PerMinute)];
        call(&h, &rates).await;
        call(&h, &rates).await;

        let refund = h
            .limiter
            .limit_request("clientA", "GET", "localhost", "/api/values", &rates, -1)
            .await
            .unwrap();
        assert_eq!(refund.state, LimitState::Success);
        assert_eq!(refund.remaining, 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let h = harness(AlgorithmKind::Sliding);
        h.store.set_failing(true);

        let result = call(&h, &[rate(1, RateUnit::PerMinute)]).await;
        assert_eq!(result.state, LimitState::LimitApplicationFailed);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_store_until_interval_elapses() {
        let h = harness(AlgorithmKind::Fixed);
        let rates = [rate(5, RateUnit::PerMinute)];
        h.store.set_failing(true);

        for _ in 0..4 {
            let result = call(&h, &rates).await;
            assert_eq!(result.state, LimitState::LimitApplicationFailed);
        }
        assert!(h.limiter.breaker().is_open());
        assert_eq!(h.store.calls(), 4);

        let skipped = call(&h, &rates).await;
        assert_eq!(skipped.state, LimitState::LimitApplicationFailed);
        assert_eq!(h.store.calls(), 4);

        h.store.set_failing(false);
        h.clock.advance(Duration::from_secs(30));
        let result = call(&h, &rates).await;
        assert_eq!(result.state, LimitState::Success);
        assert_eq!(h.store.calls(), 5);
        assert!(!h.limiter.breaker().is_open());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_reported() {
        let h = harness(AlgorithmKind::Fixed);
        let rates = [rate(1, RateUnit::PerMinute)];
        call(&h, &rates).await;

        // The counting transaction succeeds, the rollback does not.
        h.store.fail_after(1);
        let result = call(&h, &rates).await;

        assert_eq!(result.state, LimitState::ThrottledButCompensationFailed);
        assert_eq!(result.waiting_interval_ticks, 60_000);
    }

    #[tokio::test]
    async fn test_out_of_period_custom_rate_is_not_counted() {
        use crate::clock::ticks_to_datetime;
        use crate::ratelimit::LimitPeriod;

        let h = harness(AlgorithmKind::Fixed);
        let period =
            LimitPeriod::new(ticks_to_datetime(T0 + 60_000), Duration::from_secs(60), false)
                .unwrap();
        let custom = AllowedConsumptionRate::per_period(1, period).unwrap();
        let per_minute = rate(5, RateUnit::PerMinute);

        let result = call(&h, &[per_minute, custom]).await;
        assert_eq!(result.state, LimitState::NotApplicable);
        assert!(h.memory.is_empty());
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_sliding_rejects_custom_period() {
        use crate::clock::ticks_to_datetime;
        use crate::ratelimit::LimitPeriod;

        let h = harness(AlgorithmKind::Sliding);
        let period = LimitPeriod::new(ticks_to_datetime(T0), Duration::from_secs(60), true).unwrap();
        let custom = AllowedConsumptionRate::per_period(1, period).unwrap();

        let result = h
            .limiter
            .limit_request("c", "GET", "h", "/r", &[custom], 1)
            .await;
        assert!(matches!(result, Err(FloodgateError::UnsupportedRate { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_calls_never_overadmit() {
        for kind in ALL {
            let h = harness(kind);
            let rates = [rate(5, RateUnit::PerMinute)];

            let results = futures::future::join_all((0..20).map(|_| call(&h, &rates))).await;
            let admitted = results
                .iter()
                .filter(|r| r.state == LimitState::Success)
                .count();
            assert_eq!(admitted, 5, "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_algorithm_kind_parsing() {
        assert_eq!("fixed".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Fixed);
        assert_eq!(
            "Leaky-Bucket".parse::<AlgorithmKind>().unwrap(),
            AlgorithmKind::LeakyBucket
        );
        assert_eq!(
            "sliding_window".parse::<AlgorithmKind>().unwrap(),
            AlgorithmKind::Sliding
        );
        assert!("random".parse::<AlgorithmKind>().is_err());
        assert_eq!(AlgorithmKind::Stepping.build().kind(), AlgorithmKind::Stepping);
    }
}
