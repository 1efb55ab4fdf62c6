//! In-process [`RemoteStore`] with Redis semantics.
//!
//! Backs single-node deployments that run without Redis and every test that
//! needs a shared remote tier. All mutations go through one mutex, which makes
//! `set_nx` and `compare_and_delete` atomic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::error::RemoteError;
use super::lock::mutex_lock;
use super::pattern::glob_match;
use super::remote::{RemoteResult, RemoteStore};

const SOURCE: &str = "cache::memory";
const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_INTEGER: &str = "ERR value is not an integer or out of range";

#[derive(Debug, Clone)]
enum Data {
    Text(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn text(&mut self, key: &str) -> RemoteResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Text(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(RemoteError::command(WRONG_TYPE)),
        }
    }

    fn put_text(&mut self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn list_mut(&mut self, key: &str, create: bool) -> RemoteResult<Option<&mut VecDeque<String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries.insert(
                key.to_string(),
                Entry {
                    data: Data::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                data: Data::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(RemoteError::command(WRONG_TYPE)),
            None => Ok(None),
        }
    }

    fn set_mut(&mut self, key: &str, create: bool) -> RemoteResult<Option<&mut BTreeSet<String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries.insert(
                key.to_string(),
                Entry {
                    data: Data::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(RemoteError::command(WRONG_TYPE)),
            None => Ok(None),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|entry| &entry.data) {
            Some(Data::List(list)) => list.is_empty(),
            Some(Data::Set(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn add_to_counter(&mut self, key: &str, delta: i64) -> RemoteResult<i64> {
        let (current, expires_at) = match self.live(key) {
            None => (0, None),
            Some(Entry {
                data: Data::Text(value),
                expires_at,
            }) => (
                value
                    .parse::<i64>()
                    .map_err(|_| RemoteError::command(NOT_INTEGER))?,
                *expires_at,
            ),
            Some(_) => return Err(RemoteError::command(WRONG_TYPE)),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| RemoteError::command("ERR increment or decrement would overflow"))?;
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }
}

/// Shared in-memory keyspace.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: while unavailable every call fails as unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn with_keyspace<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Keyspace) -> RemoteResult<R>,
    ) -> RemoteResult<R> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RemoteError::unreachable("memory store marked unavailable"));
        }
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, op);
        f(&mut keyspace)
    }

    fn record_lookup(&self, found: bool) {
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Resolve Redis-style inclusive, possibly negative, range bounds.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> RemoteResult<Option<String>> {
        let value = self.with_keyspace("get", |ks| ks.text(key))?;
        self.record_lookup(value.is_some());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()> {
        self.with_keyspace("set", |ks| {
            ks.put_text(key, value, ttl);
            Ok(())
        })
    }

    async fn mset(&self, entries: &[(String, String)], ttl: Duration) -> RemoteResult<()> {
        self.with_keyspace("mset", |ks| {
            for (key, value) in entries {
                ks.put_text(key, value, ttl);
            }
            Ok(())
        })
    }

    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<String>>> {
        let values = self.with_keyspace("mget", |ks| {
            Ok(keys
                .iter()
                .map(|key| ks.text(key).ok().flatten())
                .collect::<Vec<_>>())
        })?;
        for value in &values {
            self.record_lookup(value.is_some());
        }
        Ok(values)
    }

    async fn del(&self, keys: &[String]) -> RemoteResult<u64> {
        self.with_keyspace("del", |ks| {
            let mut removed = 0;
            for key in keys {
                if ks.live(key).is_some() {
                    ks.entries.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn exists(&self, keys: &[String]) -> RemoteResult<u64> {
        self.with_keyspace("exists", |ks| {
            Ok(keys.iter().filter(|key| ks.live(key).is_some()).count() as u64)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RemoteResult<bool> {
        self.with_keyspace("expire", |ks| match ks.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> RemoteResult<Option<Duration>> {
        self.with_keyspace("ttl", |ks| {
            Ok(ks
                .live(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now())))
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> RemoteResult<i64> {
        self.with_keyspace("incr_by", |ks| ks.add_to_counter(key, delta))
    }

    async fn decr_by(&self, key: &str, delta: i64) -> RemoteResult<i64> {
        let delta = delta
            .checked_neg()
            .ok_or_else(|| RemoteError::command("ERR decrement would overflow"))?;
        self.with_keyspace("decr_by", |ks| ks.add_to_counter(key, delta))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<bool> {
        self.with_keyspace("set_nx", |ks| {
            if ks.live(key).is_some() {
                return Ok(false);
            }
            ks.put_text(key, value, ttl);
            Ok(true)
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> RemoteResult<bool> {
        self.with_keyspace("compare_and_delete", |ks| {
            let owned = matches!(
                ks.live(key),
                Some(Entry { data: Data::Text(current), .. }) if current == expected
            );
            if owned {
                ks.entries.remove(key);
            }
            Ok(owned)
        })
    }

    async fn keys(&self, pattern: &str) -> RemoteResult<Vec<String>> {
        self.with_keyspace("keys", |ks| {
            ks.purge_expired();
            let mut keys: Vec<String> = ks
                .entries
                .keys()
                .filter(|key| glob_match(pattern, key))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> RemoteResult<u64> {
        self.with_keyspace("lpush", |ks| {
            let list = ks
                .list_mut(key, true)?
                .ok_or_else(|| RemoteError::protocol("list was not created"))?;
            for value in values {
                list.push_front(value.clone());
            }
            Ok(list.len() as u64)
        })
    }

    async fn rpush(&self, key: &str, values: &[String]) -> RemoteResult<u64> {
        self.with_keyspace("rpush", |ks| {
            let list = ks
                .list_mut(key, true)?
                .ok_or_else(|| RemoteError::protocol("list was not created"))?;
            list.extend(values.iter().cloned());
            Ok(list.len() as u64)
        })
    }

    async fn lpop(&self, key: &str) -> RemoteResult<Option<String>> {
        self.with_keyspace("lpop", |ks| {
            let value = ks.list_mut(key, false)?.and_then(VecDeque::pop_front);
            ks.drop_if_empty(key);
            Ok(value)
        })
    }

    async fn rpop(&self, key: &str) -> RemoteResult<Option<String>> {
        self.with_keyspace("rpop", |ks| {
            let value = ks.list_mut(key, false)?.and_then(VecDeque::pop_back);
            ks.drop_if_empty(key);
            Ok(value)
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> RemoteResult<Vec<String>> {
        self.with_keyspace("lrange", |ks| {
            let Some(list) = ks.list_mut(key, false)? else {
                return Ok(Vec::new());
            };
            Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            })
        })
    }

    async fn llen(&self, key: &str) -> RemoteResult<u64> {
        self.with_keyspace("llen", |ks| {
            Ok(ks.list_mut(key, false)?.map_or(0, |list| list.len() as u64))
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> RemoteResult<u64> {
        self.with_keyspace("sadd", |ks| {
            let set = ks
                .set_mut(key, true)?
                .ok_or_else(|| RemoteError::protocol("set was not created"))?;
            let added = members
                .iter()
                .filter(|member| set.insert((*member).clone()))
                .count();
            Ok(added as u64)
        })
    }

    async fn smembers(&self, key: &str) -> RemoteResult<Vec<String>> {
        self.with_keyspace("smembers", |ks| {
            Ok(ks
                .set_mut(key, false)?
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> RemoteResult<bool> {
        self.with_keyspace("sismember", |ks| {
            Ok(ks
                .set_mut(key, false)?
                .is_some_and(|set| set.contains(member)))
        })
    }

    async fn srem(&self, key: &str, members: &[String]) -> RemoteResult<u64> {
        self.with_keyspace("srem", |ks| {
            let removed = match ks.set_mut(key, false)? {
                Some(set) => members.iter().filter(|member| set.remove(*member)).count(),
                None => 0,
            };
            ks.drop_if_empty(key);
            Ok(removed as u64)
        })
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.with_keyspace("ping", |_| Ok(()))
    }

    async fn flush_db(&self) -> RemoteResult<()> {
        self.with_keyspace("flush_db", |ks| {
            ks.entries.clear();
            Ok(())
        })
    }

    async fn info(&self) -> RemoteResult<String> {
        let keys = self.db_size().await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        Ok(format!(
            "# Server\r\nredis_mode:memory\r\n# Stats\r\nkeyspace_hits:{hits}\r\nkeyspace_misses:{misses}\r\n# Keyspace\r\ndb0:keys={keys}\r\n"
        ))
    }

    async fn db_size(&self) -> RemoteResult<u64> {
        self.with_keyspace("db_size", |ks| {
            ks.purge_expired();
            Ok(ks.entries.len() as u64)
        })
    }
}
