//! Leaky bucket (token) algorithm.
//!
//! Each rate owns a hash holding the bucket's token count and the time of its
//! last leak. Every call first drains the tokens that leaked since then, adds
//! its cost and writes the state back, all as one compound store operation.
//! The bucket leaks `limit` tokens per unit; whole leak intervals are applied
//! and the remainder carries over to the next call.

use std::collections::HashMap;
use std::time::Duration;

use super::{AlgorithmKind, Bucket, WindowAlgorithm};
use crate::clock::{duration_to_ticks, Ticks};
use crate::error::Result;
use crate::ratelimit::{AllowedConsumptionRate, RateLimitCacheKey};
use crate::store::{Command, Reply, Transaction};

/// Hash field holding the time of the last applied leak.
pub const LAST_LEAK_FIELD: &str = "l";
/// Hash field holding the current token count.
pub const TOKENS_FIELD: &str = "t";

/// Extra lifetime of a bucket past the time it takes to drain completely.
const EXPIRATION_GRACE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyBucket;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: i64,
    pub last_leak: Ticks,
}

impl BucketState {
    /// Read a bucket from its hash fields. `None` if it was never filled.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let last_leak = fields.get(LAST_LEAK_FIELD)?.parse().ok()?;
        let tokens = fields
            .get(TOKENS_FIELD)
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        Some(Self { tokens, last_leak })
    }
}

/// Drain whole leak intervals elapsed since the last leak, then add `cost`.
///
/// A bucket seen for the first time starts empty at `now`. Tokens never drop
/// below zero before the cost is added.
pub fn fill_bucket(
    previous: Option<BucketState>,
    now: Ticks,
    leak_interval: Ticks,
    leak_amount: i64,
    cost: i64,
) -> BucketState {
    let BucketState { tokens, last_leak } = previous.unwrap_or(BucketState {
        tokens: 0,
        last_leak: now,
    });

    let intervals = if now > last_leak && leak_interval > 0 {
        (now - last_leak) / leak_interval
    } else {
        0
    };

    BucketState {
        tokens: (tokens - intervals * leak_amount).max(0) + cost,
        last_leak: last_leak + intervals * leak_interval,
    }
}

/// Leak `(interval, amount)` for `limit` tokens per `unit` milliseconds.
///
/// Slow rates leak one token every `unit / limit` ms; rates above one token
/// per millisecond leak `limit / unit` tokens every millisecond.
pub fn leak_rate(limit: i64, unit: Ticks) -> (Ticks, i64) {
    if limit <= 0 || unit <= 0 {
        return (unit.max(1), 0);
    }
    if unit >= limit {
        (unit / limit, 1)
    } else {
        (1, limit / unit)
    }
}

/// Time for a full bucket to drain, plus a grace period.
fn expiration(rate: &AllowedConsumptionRate) -> Duration {
    let unit = duration_to_ticks(rate.unit_duration());
    let limit = rate.limit().max(1);
    let drain = (rate.capacity().max(0) * unit + limit - 1) / limit;
    Duration::from_millis(drain.max(0) as u64) + EXPIRATION_GRACE
}

impl WindowAlgorithm for LeakyBucket {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::LeakyBucket
    }

    fn bucket(&self, rate: &AllowedConsumptionRate, now: Ticks) -> Result<Option<Bucket>> {
        let suffix = match rate.period() {
            Some(period) => {
                if period.window_at(now).is_none() {
                    return Ok(None);
                }
                period.to_string()
            }
            None => rate.unit().as_str().to_string(),
        };

        Ok(Some(Bucket {
            suffix,
            start: now,
            length: duration_to_ticks(rate.unit_duration()),
            expiration: expiration(rate),
        }))
    }

    fn stage_apply(
        &self,
        tx: &mut Transaction,
        key: &RateLimitCacheKey,
        bucket: &Bucket,
        cost: i64,
        now: Ticks,
        _call_id: &str,
    ) -> usize {
        let (leak_interval, leak_amount) = leak_rate(key.limit(), bucket.length);
        tx.push(Command::LeakyBucket {
            key: key.to_string_key(),
            now,
            leak_interval,
            leak_amount,
            cost,
            ttl: bucket.expiration,
        })
    }

    fn stage_undo(&self, tx: &mut Transaction, key: &RateLimitCacheKey, cost: i64, _call_id: &str) {
        tx.push(Command::HIncrBy {
            key: key.to_string_key(),
            field: TOKENS_FIELD.to_string(),
            delta: -cost,
        });
    }

    fn stage_oldest(&self, tx: &mut Transaction, key: &RateLimitCacheKey) -> Option<usize> {
        Some(tx.push(Command::HGetAll {
            key: key.to_string_key(),
        }))
    }

    fn oldest_observation(&self, reply: Option<&Reply>, bucket: &Bucket) -> Ticks {
        match reply {
            Some(Reply::Hash(fields)) => BucketState::from_fields(fields)
                .map(|state| state.last_leak)
                .unwrap_or(bucket.start),
            _ => bucket.start,
        }
    }
}
