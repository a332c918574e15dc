//! Abstract transactional counter store.
//!
//! Window algorithms describe their work as a [`Transaction`] of primitive
//! [`Command`]s. A [`Store`] executes a whole transaction atomically and
//! returns one [`Reply`] per command, in order. Any store offering these
//! primitives with atomic batching can back the limiter.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::Ticks;

pub use memory::InMemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Errors raised by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// One primitive store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Add `delta` to an integer counter, creating it at 0. Replies with the new value.
    IncrBy { key: String, delta: i64 },
    /// Set the time-to-live of a key. Replies 1 if the key exists.
    Expire { key: String, ttl: Duration },
    /// Add or re-score a sorted-set member. Replies with the number of new members.
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Remove one sorted-set member. Replies with the number removed.
    ZRem { key: String, member: String },
    /// Remove members scored strictly below `max_exclusive`. Replies with the number removed.
    ZRemRangeByScore { key: String, max_exclusive: f64 },
    /// Replies with the sorted-set cardinality.
    ZCard { key: String },
    /// Replies with members (and scores) between two ranks, inclusive.
    /// Negative ranks count from the highest score.
    ZRangeWithScores { key: String, start: isize, stop: isize },
    /// Replies with every field of a hash.
    HGetAll { key: String },
    /// Add `delta` to a hash field. Replies with the new value.
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    /// Leaky-bucket compound operation, executed server-side in one step.
    ///
    /// Drains the bucket stored at `key` for the time elapsed since its last
    /// leak, adds `cost`, writes the state back and refreshes the TTL.
    /// Replies with [`Reply::Bucket`].
    LeakyBucket {
        key: String,
        now: Ticks,
        leak_interval: Ticks,
        leak_amount: i64,
        cost: i64,
        ttl: Duration,
    },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::IncrBy { key, .. }
            | Command::Expire { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZRemRangeByScore { key, .. }
            | Command::ZCard { key }
            | Command::ZRangeWithScores { key, .. }
            | Command::HGetAll { key }
            | Command::HIncrBy { key, .. }
            | Command::LeakyBucket { key, .. } => key,
        }
    }
}

/// Reply to one [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Integer(i64),
    Scored(Vec<(String, f64)>),
    Hash(HashMap<String, String>),
    Bucket { tokens: i64, last_leak: Ticks },
}

impl Reply {
    pub fn as_integer(&self) -> Result<i64, StoreError> {
        match self {
            Reply::Integer(n) => Ok(*n),
            Reply::Bucket { tokens, .. } => Ok(*tokens),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected an integer, got {:?}",
                other
            ))),
        }
    }
}

/// An ordered batch of commands executed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command and return the index its reply will have.
    pub fn push(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A shared store that executes transactions atomically.
///
/// Implementations must be safe to share across tasks; one handle serves
/// every concurrent evaluation.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Execute every command of `tx` atomically, returning replies in order.
    async fn execute(&self, tx: Transaction) -> Result<Vec<Reply>, StoreError>;
}

/// Fetch reply `index`, failing if the store returned too few replies.
pub fn reply_at(replies: &[Reply], index: usize) -> Result<&Reply, StoreError> {
    replies.get(index).ok_or_else(|| {
        StoreError::UnexpectedReply(format!(
            "missing reply {} of {}",
            index,
            replies.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_push_returns_indices() {
        let mut tx = Transaction::new();
        assert!(tx.is_empty());
        let a = tx.push(Command::IncrBy {
            key: "a".to_string(),
            delta: 1,
        });
        let b = tx.push(Command::ZCard {
            key: "b".to_string(),
        });
        assert_eq!((a, b), (0, 1));
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.commands()[1].key(), "b");
    }

    #[test]
    fn test_reply_as_integer() {
        assert_eq!(Reply::Integer(7).as_integer().unwrap(), 7);
        assert_eq!(
            Reply::Bucket {
                tokens: 3,
                last_leak: 0
            }
            .as_integer()
            .unwrap(),
            3
        );
        assert!(Reply::Scored(Vec::new()).as_integer().is_err());
    }

    #[test]
    fn test_reply_at_bounds() {
        let replies = vec![Reply::Integer(1)];
        assert!(reply_at(&replies, 0).is_ok());
        assert!(matches!(
            reply_at(&replies, 1),
            Err(StoreError::UnexpectedReply(_))
        ));
    }
}
