//! Stepping window.
//!
//! Shares the fixed window's key scheme and counter operations: the window
//! steps forward one whole unit at a time and the counter starts over at each
//! step. Deployments select it by name independently of [`FixedWindow`].
//!
//! [`FixedWindow`]: super::FixedWindow

use super::fixed::{calendar_bucket, stage_decrement, stage_increment};
use super::{AlgorithmKind, Bucket, WindowAlgorithm};
use crate::clock::Ticks;
use crate::error::Result;
use crate::ratelimit::{AllowedConsumptionRate, RateLimitCacheKey};
use crate::store::Transaction;

#[derive(Debug, Clone, Copy, Default)]
pub struct SteppingWindow;

impl WindowAlgorithm for SteppingWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Stepping
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
