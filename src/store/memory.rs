//! In-process store.
//!
//! A single mutex guards the whole keyspace, so every transaction executes
//! atomically with respect to every other. Keys expire lazily against the
//! injected clock, and every [`SWEEP_INTERVAL`] transactions the whole
//! keyspace is swept so buckets that are never touched again are freed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Command, Reply, Store, StoreError, Transaction};
use crate::algorithm::leaky_bucket::{fill_bucket, BucketState, LAST_LEAK_FIELD, TOKENS_FIELD};
use crate::clock::{duration_to_ticks, Clock, SystemClock, Ticks};

/// Number of transactions between full sweeps of expired keys.
pub const SWEEP_INTERVAL: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    /// Members ordered by `(score, member)`
    SortedSet(Vec<(String, f64)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Ticks>,
}

/// Store implementation backed by process memory.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    executed: AtomicUsize,
}

impl InMemoryStore {
    /// Create a store that expires keys against the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create a store that expires keys against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            executed: AtomicUsize::new(0),
        }
    }

    /// Current value of an integer counter, `None` if absent or expired.
    pub fn counter(&self, key: &str) -> Option<i64> {
        match self.live_value(key)? {
            Value::Counter(n) => Some(n),
            _ => None,
        }
    }

    /// Cardinality of a sorted set, `None` if absent or expired.
    pub fn set_len(&self, key: &str) -> Option<usize> {
        match self.live_value(key)? {
            Value::SortedSet(members) => Some(members.len()),
            _ => None,
        }
    }

    /// Contents of a hash, `None` if absent or expired.
    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        match self.live_value(key)? {
            Value::Hash(fields) => Some(fields),
            _ => None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ticks();
        self.entries
            .lock()
            .values()
            .filter(|e| !is_expired(e, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every expired key now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ticks();
        sweep(&mut self.entries.lock(), now)
    }

    fn live_value(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_ticks();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| !is_expired(e, now))
            .map(|e| e.value.clone())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(entry: &Entry, now: Ticks) -> bool {
    entry.expires_at.is_some_and(|at| now >= at)
}

fn sweep(entries: &mut HashMap<String, Entry>, now: Ticks) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !is_expired(entry, now));
    before - entries.len()
}

/// Mutable view over the keyspace for the duration of one transaction.
struct Keyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: Ticks,
}

impl Keyspace<'_> {
    fn purge_if_expired(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| is_expired(e, self.now)) {
            self.entries.remove(key);
        }
    }

    fn get(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn get_or_insert(&mut self, key: &str, init: impl FnOnce() -> Value) -> &mut Entry {
        self.purge_if_expired(key);
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        })
    }

    fn apply(&mut self, command: &Command) -> Result<Reply, StoreError> {
        let wrong_type = || StoreError::WrongType {
            key: command.key().to_string(),
        };

        match command {
            Command::IncrBy { key, delta } => {
                match &mut self.get_or_insert(key, || Value::Counter(0)).value {
                    Value::Counter(n) => {
                        *n += delta;
                        Ok(Reply::Integer(*n))
                    }
                    _ => Err(wrong_type()),
                }
            }
            Command::Expire { key, ttl } => {
                let expires_at = self.now + duration_to_ticks(*ttl);
                match self.get(key) {
                    Some(entry) => {
                        entry.expires_at = Some(expires_at);
                        Ok(Reply::Integer(1))
                    }
                    None => Ok(Reply::Integer(0)),
                }
            }
            Command::ZAdd { key, member, score } => {
                match &mut self.get_or_insert(key, || Value::SortedSet(Vec::new())).value {
                    Value::SortedSet(members) => {
                        let existed = members.iter().position(|(m, _)| m == member);
                        if let Some(index) = existed {
                            members.remove(index);
                        }
                        let at = members
                            .partition_point(|(m, s)| (*s, m.as_str()) < (*score, member.as_str()));
                        members.insert(at, (member.clone(), *score));
                        Ok(Reply::Integer(if existed.is_some() { 0 } else { 1 }))
                    }
                    _ => Err(wrong_type()),
                }
            }
            Command::ZRem { key, member } => match self.get(key).map(|e| &mut e.value) {
                Some(Value::SortedSet(members)) => {
                    let before = members.len();
                    members.retain(|(m, _)| m != member);
                    Ok(Reply::Integer((before - members.len()) as i64))
                }
                Some(_) => Err(wrong_type()),
                None => Ok(Reply::Integer(0)),
            },
            Command::ZRemRangeByScore { key, max_exclusive } => {
                match self.get(key).map(|e| &mut e.value) {
                    Some(Value::SortedSet(members)) => {
                        let before = members.len();
                        members.retain(|(_, s)| *s >= *max_exclusive);
                        Ok(Reply::Integer((before - members.len()) as i64))
                    }
                    Some(_) => Err(wrong_type()),
                    None => Ok(Reply::Integer(0)),
                }
            }
            Command::ZCard { key } => match self.get(key).map(|e| &e.value) {
                Some(Value::SortedSet(members)) => Ok(Reply::Integer(members.len() as i64)),
                Some(_) => Err(wrong_type()),
                None => Ok(Reply::Integer(0)),
            },
            Command::ZRangeWithScores { key, start, stop } => {
                match self.get(key).map(|e| &e.value) {
                    Some(Value::SortedSet(members)) => {
                        Ok(Reply::Scored(rank_range(members, *start, *stop)))
                    }
                    Some(_) => Err(wrong_type()),
                    None => Ok(Reply::Scored(Vec::new())),
                }
            }
            Command::HGetAll { key } => match self.get(key).map(|e| &e.value) {
                Some(Value::Hash(fields)) => Ok(Reply::Hash(fields.clone())),
                Some(_) => Err(wrong_type()),
                None => Ok(Reply::Hash(HashMap::new())),
            },
            Command::HIncrBy { key, field, delta } => {
                match &mut self.get_or_insert(key, || Value::Hash(HashMap::new())).value {
                    Value::Hash(fields) => {
                        let current = match fields.get(field) {
                            Some(raw) => raw.parse::<i64>().map_err(|_| {
                                StoreError::UnexpectedReply(format!(
                                    "hash field {} is not an integer",
                                    field
                                ))
                            })?,
                            None => 0,
                        };
                        let updated = current + delta;
                        fields.insert(field.clone(), updated.to_string());
                        Ok(Reply::Integer(updated))
                    }
                    _ => Err(wrong_type()),
                }
            }
            Command::LeakyBucket {
                key,
                now,
                leak_interval,
                leak_amount,
                cost,
                ttl,
            } => {
                let expires_at = self.now + duration_to_ticks(*ttl);
                let entry = self.get_or_insert(key, || Value::Hash(HashMap::new()));
                let Value::Hash(fields) = &mut entry.value else {
                    return Err(wrong_type());
                };
                let previous = BucketState::from_fields(fields);
                let next = fill_bucket(previous, *now, *leak_interval, *leak_amount, *cost);
                fields.insert(LAST_LEAK_FIELD.to_string(), next.last_leak.to_string());
                fields.insert(TOKENS_FIELD.to_string(), next.tokens.to_string());
                entry.expires_at = Some(expires_at);
                Ok(Reply::Bucket {
                    tokens: next.tokens,
                    last_leak: next.last_leak,
                })
            }
        }
    }
}

/// Resolve Redis-style inclusive rank bounds (negative counts from the end).
fn rank_range(members: &[(String, f64)], start: isize, stop: isize) -> Vec<(String, f64)> {
    let len = members.len() as isize;
    let resolve = |i: isize| if i < 0 { len + i } else { i };
    let start = resolve(start).max(0);
    let stop = resolve(stop).min(len - 1);
    if len == 0 || start > stop {
        return Vec::new();
    }
    members[start as usize..=stop as usize].to_vec()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn execute(&self, tx: Transaction) -> Result<Vec<Reply>, StoreError> {
        let now = self.clock.now_ticks();
        let mut entries = self.entries.lock();

        // Snapshot touched keys so a failing command leaves the keyspace untouched.
        let snapshot: Vec<(String, Option<Entry>)> = tx
            .commands()
            .iter()
            .map(|c| (c.key().to_string(), entries.get(c.key()).cloned()))
            .collect();

        let mut keyspace = Keyspace {
            entries: &mut *entries,
            now,
        };
        let outcome = tx
            .commands()
            .iter()
            .map(|command| keyspace.apply(command))
            .collect::<Result<Vec<_>, _>>();

        let replies = match outcome {
            Ok(replies) => replies,
            Err(e) => {
                for (key, prior) in snapshot.into_iter().rev() {
                    match prior {
                        Some(entry) => {
                            entries.insert(key, entry);
                        }
                        None => {
                            entries.remove(&key);
                        }
                    }
                }
                return Err(e);
            }
        };

        if self.executed.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let removed = sweep(&mut entries, now);
            if removed > 0 {
                debug!(removed = removed, remaining = entries.len(), "Swept expired keys");
            }
        }

        trace!(commands = tx.len(), "Executed in-memory transaction");
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store() -> (InMemoryStore, ManualClock) {
        let clock = ManualClock::at_ticks(1_000_000);
        (InMemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn single(command: Command) -> Transaction {
        let mut tx = Transaction::new();
        tx.push(command);
        tx
    }

    #[tokio::test]
    async fn test_incr_and_expire() {
        let (store, clock) = store();
        let mut tx = Transaction::new();
        tx.push(Command::IncrBy {
            key: "k".to_string(),
            delta: 2,
        });
        tx.push(Command::Expire {
            key: "k".to_string(),
            ttl: Duration::from_secs(1),
        });
        let replies = store.execute(tx).await.unwrap();
        assert_eq!(replies, vec![Reply::Integer(2), Reply::Integer(1)]);
        assert_eq!(store.counter("k"), Some(2));

        clock.advance(Duration::from_millis(999));
        assert_eq!(store.counter("k"), Some(2));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.counter("k"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_counter_restarts_at_zero() {
        let (store, clock) = store();
        let mut tx = Transaction::new();
        tx.push(Command::IncrBy {
            key: "k".to_string(),
            delta: 5,
        });
        tx.push(Command::Expire {
            key: "k".to_string(),
            ttl: Duration::from_secs(1),
        });
        store.execute(tx).await.unwrap();

        clock.advance(Duration::from_secs(2));
        let replies = store
            .execute(single(Command::IncrBy {
                key: "k".to_string(),
                delta: 1,
            }))
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Integer(1)]);
    }

    #[tokio::test]
    async fn test_sorted_set_operations() {
        let (store, _clock) = store();
        let mut tx = Transaction::new();
        for (member, score) in [("b", 20.0), ("a", 10.0), ("c", 30.0)] {
            tx.push(Command::ZAdd {
                key: "z".to_string(),
                member: member.to_string(),
                score,
            });
        }
        tx.push(Command::ZRemRangeByScore {
            key: "z".to_string(),
            max_exclusive: 20.0,
        });
        tx.push(Command::ZCard {
            key: "z".to_string(),
        });
        tx.push(Command::ZRangeWithScores {
            key: "z".to_string(),
            start: 0,
            stop: 0,
        });
        tx.push(Command::ZRangeWithScores {
            key: "z".to_string(),
            start: -1,
            stop: -1,
        });

        let replies = store.execute(tx).await.unwrap();
        assert_eq!(replies[3], Reply::Integer(1));
        assert_eq!(replies[4], Reply::Integer(2));
        assert_eq!(replies[5], Reply::Scored(vec![("b".to_string(), 20.0)]));
        assert_eq!(replies[6], Reply::Scored(vec![("c".to_string(), 30.0)]));

        let replies = store
            .execute(single(Command::ZRem {
                key: "z".to_string(),
                member: "c".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Integer(1)]);
        assert_eq!(store.set_len("z"), Some(1));
    }

    #[tokio::test]
    async fn test_zadd_rescores_existing_member() {
        let (store, _clock) = store();
        let mut tx = Transaction::new();
        tx.push(Command::ZAdd {
            key: "z".to_string(),
            member: "a".to_string(),
            score: 1.0,
        });
        tx.push(Command::ZAdd {
            key: "z".to_string(),
            member: "a".to_string(),
            score: 5.0,
        });
        let replies = store.execute(tx).await.unwrap();
        assert_eq!(replies, vec![Reply::Integer(1), Reply::Integer(0)]);
        assert_eq!(store.set_len("z"), Some(1));
    }

    #[tokio::test]
    async fn test_hash_increment() {
        let (store, _clock) = store();
        let replies = store
            .execute(single(Command::HIncrBy {
                key: "h".to_string(),
                field: "t".to_string(),
                delta: -3,
            }))
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Integer(-3)]);
        assert_eq!(store.hash("h").unwrap()["t"], "-3");
    }

    #[tokio::test]
    async fn test_wrong_type_aborts_whole_transaction() {
        let (store, _clock) = store();
        store
            .execute(single(Command::IncrBy {
                key: "k".to_string(),
                delta: 1,
            }))
            .await
            .unwrap();

        let mut tx = Transaction::new();
        tx.push(Command::IncrBy {
            key: "other".to_string(),
            delta: 1,
        });
        tx.push(Command::ZCard {
            key: "k".to_string(),
        });
        let result = store.execute(tx).await;

        assert!(matches!(result, Err(StoreError::WrongType { .. })));
        assert_eq!(store.counter("other"), None);
    }

    #[tokio::test]
    async fn test_leaky_bucket_command() {
        let (store, _clock) = store();
        let bucket = |now: Ticks| {
            single(Command::LeakyBucket {
                key: "b".to_string(),
                now,
                leak_interval: 100,
                leak_amount: 1,
                cost: 1,
                ttl: Duration::from_secs(10),
            })
        };

        let replies = store.execute(bucket(1_000_000)).await.unwrap();
        assert_eq!(
            replies,
            vec![Reply::Bucket {
                tokens: 1,
                last_leak: 1_000_000
            }]
        );

        store.execute(bucket(1_000_050)).await.unwrap();
        let replies = store.execute(bucket(1_000_250)).await.unwrap();
        // Two intervals leaked two tokens from 2, then one was added.
        assert_eq!(
            replies,
            vec![Reply::Bucket {
                tokens: 1,
                last_leak: 1_000_200
            }]
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();
        for (key, ttl) in [("short", 1), ("long", 60)] {
            let mut tx = Transaction::new();
            tx.push(Command::IncrBy {
                key: key.to_string(),
                delta: 1,
            });
            tx.push(Command::Expire {
                key: key.to_string(),
                ttl: Duration::from_secs(ttl),
            });
            store.execute(tx).await.unwrap();
        }

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.entries.lock().len(), 1);
        assert_eq!(store.counter("long"), Some(1));
    }

    #[tokio::test]
    async fn test_abandoned_buckets_are_swept() {
        let (store, clock) = store();

        // A new per-second bucket every second, for ten clients.
        for i in 0..10_000 {
            let key = format!("client{}::GET h/r::{}", i % 10, i / 10);
            let mut tx = Transaction::new();
            tx.push(Command::IncrBy {
                key: key.clone(),
                delta: 1,
            });
            tx.push(Command::Expire {
                key,
                ttl: Duration::from_secs(1),
            });
            store.execute(tx).await.unwrap();
            if i % 10 == 9 {
                clock.advance(Duration::from_secs(1));
            }
        }

        assert_eq!(store.len(), 0);
        assert!(store.entries.lock().len() <= SWEEP_INTERVAL + 10);
    }

    #[test]
    fn test_rank_range() {
        let members: Vec<(String, f64)> = (0..5).map(|i| (i.to_string(), i as f64)).collect();
        assert_eq!(rank_range(&members, 0, 1).len(), 2);
        assert_eq!(rank_range(&members, -2, -1)[0].0, "3");
        assert!(rank_range(&members, 3, 1).is_empty());
        assert!(rank_range(&[], 0, 0).is_empty());
    }
}
