//! Sliding window backed by a sorted set of call timestamps.
//!
//! Every counted call is a uniquely named member scored at its arrival time.
//! Members older than one unit are trimmed before counting, so the window
//! always covers exactly the last unit.

use std::time::Duration;

use super::{AlgorithmKind, Bucket, WindowAlgorithm};
use crate::clock::{duration_to_ticks, Ticks};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{AllowedConsumptionRate, RateLimitCacheKey, RateUnit};
use crate::store::{Command, Reply, Transaction};

/// Extra lifetime of the set past the window it covers.
const EXPIRATION_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindow;

/// Set members recorded for one call; one per unit of positive cost.
fn members(call_id: &str, cost: i64) -> impl Iterator<Item = String> + '_ {
    (0..cost.max(0)).map(move |i| format!("{}:{}", call_id, i))
}

impl WindowAlgorithm for SlidingWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Sliding
    }

    fn bucket(&self, rate: &AllowedConsumptionRate, now: Ticks) -> Result<Option<Bucket>> {
        let unit = rate.unit();
        if unit == RateUnit::PerCustomPeriod || rate.period().is_some() {
            return Err(FloodgateError::UnsupportedRate {
                algorithm: AlgorithmKind::Sliding.as_str(),
                unit: unit.to_string(),
            });
        }

        let length = rate.unit_duration();
        Ok(Some(Bucket {
            suffix: unit.as_str().to_string(),
            start: now,
            length: duration_to_ticks(length),
            expiration: length + EXPIRATION_GRACE,
        }))
    }

    fn stage_apply(
        &self,
        tx: &mut Transaction,
        key: &RateLimitCacheKey,
        bucket: &Bucket,
        cost: i64,
        now: Ticks,
        call_id: &str,
    ) -> usize {
        let key = key.to_string_key();
        tx.push(Command::ZRemRangeByScore {
            key: key.clone(),
            max_exclusive: (now - bucket.length) as f64,
        });
        for member in members(call_id, cost) {
            tx.push(Command::ZAdd {
                key: key.clone(),
                member,
                score: now as f64,
            });
        }
        let slot = tx.push(Command::ZCard { key: key.clone() });
        tx.push(Command::Expire {
            key,
            ttl: bucket.expiration,
        });
        slot
    }

    fn stage_undo(&self, tx: &mut Transaction, key: &RateLimitCacheKey, cost: i64, call_id: &str) {
        for member in members(call_id, cost) {
            tx.push(Command::ZRem {
                key: key.to_string_key(),
                member,
            });
        }
    }

    fn stage_oldest(&self, tx: &mut Transaction, key: &RateLimitCacheKey) -> Option<usize> {
        Some(tx.push(Command::ZRangeWithScores {
            key: key.to_string_key(),
            start: 0,
            stop: 0,
        }))
    }

    fn oldest_observation(&self, reply: Option<&Reply>, bucket: &Bucket) -> Ticks {
        match reply {
            Some(Reply::Scored(members)) => members
                .first()
                .map(|(_, score)| *score as Ticks)
                .unwrap_or(bucket.start),
            _ => bucket.start,
        }
    }
}
