//! Redis-backed store.
//!
//! Every [`Transaction`] becomes one `MULTI`/`EXEC` pipeline on a shared
//! [`ConnectionManager`], so all rates of a policy are evaluated atomically.
//! The leaky-bucket compound operation runs as a Lua `EVAL` inside the
//! pipeline and mirrors [`fill_bucket`](crate::algorithm::leaky_bucket::fill_bucket).
//!
//! ## Timeouts
//!
//! Connecting and each transaction are bounded by the configured timeouts;
//! an expired timeout is reported as [`StoreError::Timeout`] and counts as a
//! fault for the circuit breaker.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Pipeline, Value};
use tracing::{debug, info};

use super::{Command, Reply, Store, StoreError, Transaction};
use crate::clock::duration_to_ticks;

/// Drains, fills and persists a leaky bucket in one server-side step.
///
/// KEYS[1] = bucket hash; ARGV = now, leak interval, leak amount, cost, ttl (ms).
const LEAKY_BUCKET_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local amount = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local state = redis.call('HMGET', KEYS[1], 'l', 't')
local last = tonumber(state[1])
local tokens = tonumber(state[2]) or 0
if last == nil then
  last = now
  tokens = 0
end
local intervals = 0
if now > last then
  intervals = math.floor((now - last) / interval)
end
tokens = math.max(0, tokens - intervals * amount) + cost
last = last + intervals * interval
redis.call('HSET', KEYS[1], 'l', last, 't', tokens)
redis.call('PEXPIRE', KEYS[1], ttl)
return {tokens, last}
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Upper bound on establishing the connection
    pub connect_timeout: Duration,
    /// Upper bound on each transaction round-trip
    pub operation_timeout: Duration,
    /// Prefix prepended to every key
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(1),
            key_prefix: String::new(),
        }
    }
}

/// Redis-backed store shared by all evaluations.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid, the connection fails, or it does
    /// not complete within `connect_timeout`.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)??;

        info!(url = %url, "Connected to Redis store");
        Ok(Self { connection, config })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn pipeline(&self, tx: &Transaction) -> Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for command in tx.commands() {
            let key = self.key(command.key());
            match command {
                Command::IncrBy { delta, .. } => {
                    pipe.cmd("INCRBY").arg(&key).arg(*delta);
                }
                Command::Expire { ttl, .. } => {
                    pipe.cmd("PEXPIRE").arg(&key).arg(duration_to_ticks(*ttl));
                }
                Command::ZAdd { member, score, .. } => {
                    pipe.cmd("ZADD").arg(&key).arg(*score).arg(member);
                }
                Command::ZRem { member, .. } => {
                    pipe.cmd("ZREM").arg(&key).arg(member);
                }
                Command::ZRemRangeByScore { max_exclusive, .. } => {
                    pipe.cmd("ZREMRANGEBYSCORE")
                        .arg(&key)
                        .arg("-inf")
                        .arg(format!("({}", max_exclusive));
                }
                Command::ZCard { .. } => {
                    pipe.cmd("ZCARD").arg(&key);
                }
                Command::ZRangeWithScores { start, stop, .. } => {
                    pipe.cmd("ZRANGE")
                        .arg(&key)
                        .arg(*start)
                        .arg(*stop)
                        .arg("WITHSCORES");
                }
                Command::HGetAll { .. } => {
                    pipe.cmd("HGETALL").arg(&key);
                }
                Command::HIncrBy { field, delta, .. } => {
                    pipe.cmd("HINCRBY").arg(&key).arg(field).arg(*delta);
                }
                Command::LeakyBucket {
                    now,
                    leak_interval,
                    leak_amount,
                    cost,
                    ttl,
                    ..
                } => {
                    pipe.cmd("EVAL")
                        .arg(LEAKY_BUCKET_SCRIPT)
                        .arg(1)
                        .arg(&key)
                        .arg(*now)
                        .arg(*leak_interval)
                        .arg(*leak_amount)
                        .arg(*cost)
                        .arg(duration_to_ticks(*ttl));
                }
            }
        }

        pipe
    }
}

fn to_reply(command: &Command, value: &Value) -> Result<Reply, StoreError> {
    let reply = match command {
        Command::ZRangeWithScores { .. } => {
            Reply::Scored(redis::from_redis_value::<Vec<(String, f64)>>(value)?)
        }
        Command::HGetAll { .. } => {
            Reply::Hash(redis::from_redis_value::<HashMap<String, String>>(value)?)
        }
        Command::LeakyBucket { .. } => {
            let (tokens, last_leak): (i64, i64) = redis::from_redis_value(value)?;
            Reply::Bucket { tokens, last_leak }
        }
        _ => Reply::Integer(redis::from_redis_value::<i64>(value)?),
    };
    Ok(reply)
}

#[async_trait]
impl Store for RedisStore {
    async fn execute(&self, tx: Transaction) -> Result<Vec<Reply>, StoreError> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }

        let pipe = self.pipeline(&tx);
        let mut conn = self.connection.clone();
        let values: Vec<Value> =
            tokio::time::timeout(self.config.operation_timeout, pipe.query_async(&mut conn))
                .await
                .map_err(|_| StoreError::Timeout)??;

        if values.len() != tx.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                tx.len(),
                values.len()
            )));
        }

        debug!(commands = tx.len(), "Executed Redis transaction");
        tx.commands()
            .iter()
            .zip(values.iter())
            .map(|(command, value)| to_reply(command, value))
            .collect()
    }
}
