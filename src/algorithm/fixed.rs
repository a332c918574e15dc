//! Fixed window: one counter per calendar bucket.

use std::time::Duration;

use super::{AlgorithmKind, Bucket, WindowAlgorithm};
use crate::clock::{duration_to_ticks, ticks_to_datetime, Ticks};
use crate::error::Result;
use crate::ratelimit::{AllowedConsumptionRate, RateLimitCacheKey, RateUnit};
use crate::store::{Command, Transaction};

/// Counts calls in buckets aligned to the rate's unit (or custom period).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

/// `chrono` pattern truncating a timestamp to the unit's granularity.
fn truncation_pattern(unit: RateUnit) -> &'static str {
    match unit {
        RateUnit::PerSecond => "%Y%m%d%H%M%S",
        RateUnit::PerMinute => "%Y%m%d%H%M",
        RateUnit::PerHour => "%Y%m%d%H",
        RateUnit::PerDay | RateUnit::PerCustomPeriod => "%Y%m%d",
    }
}

/// The calendar bucket containing `now`.
///
/// Fixed units truncate `now` to the unit; custom periods use the active
/// `[from, to)` window, named after its bounds.
pub(crate) fn calendar_bucket(rate: &AllowedConsumptionRate, now: Ticks) -> Option<Bucket> {
    let expiration = rate.unit_duration();

    if let Some(period) = rate.period() {
        let (from, to) = period.window_at(now)?;
        let suffix = format!(
            "{}-{}",
            ticks_to_datetime(from).format("%Y%m%d%H%M%S"),
            ticks_to_datetime(to).format("%Y%m%d%H%M%S")
        );
        return Some(Bucket {
            suffix,
            start: from,
            length: to - from,
            expiration,
        });
    }

    let length = duration_to_ticks(expiration);
    if length <= 0 {
        return None;
    }
    let start = now - now.rem_euclid(length);
    Some(Bucket {
        suffix: ticks_to_datetime(start)
            .format(truncation_pattern(rate.unit()))
            .to_string(),
        start,
        length,
        expiration,
    })
}

/// Increment the bucket counter by `cost` and refresh its TTL.
pub(crate) fn stage_increment(
    tx: &mut Transaction,
    key: &RateLimitCacheKey,
    cost: i64,
    ttl: Duration,
) -> usize {
    let slot = tx.push(Command::IncrBy {
        key: key.to_string_key(),
        delta: cost,
    });
    tx.push(Command::Expire {
        key: key.to_string_key(),
        ttl,
    });
    slot
}

pub(crate) fn stage_decrement(tx: &mut Transaction, key: &RateLimitCacheKey, cost: i64) {
    tx.push(Command::IncrBy {
        key: key.to_string_key(),
        delta: -cost,
    });
}

impl WindowAlgorithm for FixedWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Fixed
    }

    fn bucket(&self, rate: &AllowedConsumptionRate, now: Ticks) -> Result<Option<Bucket>> {
        Ok(calendar_bucket(rate, now))
    }

    fn stage_apply(
        &self,
        tx: &mut Transaction,
        key: &RateLimitCacheKey,
        bucket: &Bucket,
        cost: i64,
        _now: Ticks,
        _call_id: &str,
    ) -> usize {
        stage_increment(tx, key, cost, bucket.expiration)
    }

    fn stage_undo(&self, tx: &mut Transaction, key: &RateLimitCacheKey, cost: i64, _call_id: &str) {
        stage_decrement(tx, key, cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::tests::{call, harness, rate, T0};
    use crate::ratelimit::{LimitPeriod, LimitState};

    #[test]
    fn test_bucket_suffix_per_unit() {
        let now = T0 + 61_500; // 11:01:01.5
        let suffix = |unit| calendar_bucket(&rate(1, unit), now).unwrap().suffix;

        assert_eq!(suffix(RateUnit::PerSecond), "20261017110101");
        assert_eq!(suffix(RateUnit::PerMinute), "202610171101");
        assert_eq!(suffix(RateUnit::PerHour), "2026101711");
        assert_eq!(suffix(RateUnit::PerDay), "20261017");
    }

    #[test]
    fn test_bucket_start_is_truncated() {
        let bucket = calendar_bucket(&rate(1, RateUnit::PerMinute), T0 + 61_500).unwrap();
        assert_eq!(bucket.start, T0 + 60_000);
        assert_eq!(bucket.length, 60_000);
        assert_eq!(bucket.expiration, Duration::from_secs(60));
    }

    #[test]
    fn test_custom_period_bucket() {
        let period =
            LimitPeriod::new(ticks_to_datetime(T0), Duration::from_secs(300), true).unwrap();
        let custom = AllowedConsumptionRate::per_period(10, period).unwrap();

        let bucket = calendar_bucket(&custom, T0 + 301_000).unwrap();
        assert_eq!(bucket.start, T0 + 300_000);
        assert_eq!(bucket.length, 300_000);
        assert_eq!(bucket.suffix, "20261017110500-20261017111000");

        assert!(calendar_bucket(&custom, T0 - 1).is_none());
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_resets_counter() {
        let h = harness(AlgorithmKind::Fixed);
        let rates = [rate(1, RateUnit::PerMinute)];

        h.clock.advance(Duration::from_secs(59));
        assert_eq!(call(&h, &rates).await.state, LimitState::Success);
        let throttled = call(&h, &rates).await;
        assert_eq!(throttled.state, LimitState::Throttled);
        assert_eq!(throttled.waiting_interval_ticks, 1_000);

        // A new calendar minute starts a new bucket.
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(call(&h, &rates).await.state, LimitState::Success);
    }

    #[tokio::test]
    async fn test_custom_period_is_enforced_inside_period() {
        let h = harness(AlgorithmKind::Fixed);
        let period =
            LimitPeriod::new(ticks_to_datetime(T0), Duration::from_secs(600), false).unwrap();
        let rates = [AllowedConsumptionRate::per_period(2, period).unwrap()];

        assert_eq!(call(&h, &rates).await.state, LimitState::Success);
        assert_eq!(call(&h, &rates).await.state, LimitState::Success);
        let throttled = call(&h, &rates).await;
        assert_eq!(throttled.state, LimitState::Throttled);
        assert_eq!(throttled.waiting_interval_ticks, 600_000);

        h.clock.advance(Duration::from_secs(600));
        assert_eq!(call(&h, &rates).await.state, LimitState::NotApplicable);
    }
}
