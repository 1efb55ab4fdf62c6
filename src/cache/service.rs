//! Two-tier cache orchestration and distributed locking.
//!
//! Values are stored as JSON text. Keys accepted by [`CacheConfig::is_hot_key`]
//! are mirrored into a process-local tier; everything else always goes to the
//! remote store. Lists, sets and counters are remote-only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::error::{BatchFailure, BatchFailures, CacheError, RemoteError};
use super::keys::{lock_key, lock_record_key};
use super::local::LocalCache;
use super::remote::RemoteStore;

const METRIC_LOCAL_HIT: &str = "strata_cache_local_hit_total";
const METRIC_LOCAL_MISS: &str = "strata_cache_local_miss_total";
const METRIC_REMOTE_HIT: &str = "strata_cache_remote_hit_total";
const METRIC_REMOTE_MISS: &str = "strata_cache_remote_miss_total";

const LOCK_TOKEN_BYTES: usize = 16;

/// Proof of a successful [`CacheService::try_lock`].
///
/// The token is random per acquisition; only the holder of the value stored
/// remotely under `lock:<key>` can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedLock {
    key: String,
    token: String,
    ttl: Duration,
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn new_lock_token() -> String {
    hex::encode(rand::random::<[u8; LOCK_TOKEN_BYTES]>())
}

pub struct CacheService {
    remote: Option<Arc<dyn RemoteStore>>,
    local: LocalCache<String>,
    lock_tokens: LocalCache<String>,
    config: CacheConfig,
}

impl CacheService {
    pub fn new(remote: Arc<dyn RemoteStore>, config: CacheConfig) -> Self {
        Self::with_remote(Some(remote), config)
    }

    /// A service without a remote tier: every remote-backed call reports
    /// [`CacheError::Unavailable`].
    pub fn disconnected(config: CacheConfig) -> Self {
        Self::with_remote(None, config)
    }

    pub fn with_remote(remote: Option<Arc<dyn RemoteStore>>, config: CacheConfig) -> Self {
        Self {
            remote,
            local: LocalCache::new("service", config.local_max_entries),
            lock_tokens: LocalCache::new("lock_tokens", config.local_max_entries),
            config,
        }
    }

    pub fn is_available(&self) -> bool {
        self.remote.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_hot_key(&self, key: &str) -> bool {
        self.config.is_hot_key(key)
    }

    /// Number of values currently held by the local tier.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    fn remote(&self) -> Result<&dyn RemoteStore, CacheError> {
        self.remote.as_deref().ok_or(CacheError::Unavailable)
    }

    fn serialize<V: Serialize + ?Sized>(key: &str, value: &V) -> Result<String, CacheError> {
        serde_json::to_string(value).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })
    }

    fn lookup_local(&self, key: &str) -> Option<String> {
        if !self.is_hot_key(key) {
            return None;
        }
        let value = self.local.get(key);
        if value.is_some() {
            counter!(METRIC_LOCAL_HIT).increment(1);
        } else {
            counter!(METRIC_LOCAL_MISS).increment(1);
        }
        value
    }

    fn record_remote(&self, key: &str, value: Option<&String>) {
        match value {
            Some(value) => {
                counter!(METRIC_REMOTE_HIT).increment(1);
                if self.is_hot_key(key) {
                    self.local
                        .set(key, value.clone(), self.config.local_backfill_ttl());
                }
            }
            None => counter!(METRIC_REMOTE_MISS).increment(1),
        }
    }

    /// Serialize `value` and store it remotely for `ttl_secs`.
    ///
    /// A zero TTL or a disabled cache stores nothing.
    pub async fn set<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        if !self.config.enabled || ttl_secs == 0 {
            return Ok(());
        }
        let remote = self.remote()?;
        let payload = Self::serialize(key, value)?;
        let ttl = Duration::from_secs(ttl_secs);

        remote.set(key, &payload, ttl).await?;
        if self.is_hot_key(key) {
            self.local.set(key, payload, ttl);
        }
        Ok(())
    }

    /// Stored JSON text for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if !self.config.enabled {
            return Ok(None);
        }
        if let Some(value) = self.lookup_local(key) {
            return Ok(Some(value));
        }

        let value = self.remote()?.get(key).await?;
        self.record_remote(key, value.as_ref());
        Ok(value)
    }

    /// Like [`get`](Self::get), decoded into a fresh `T`.
    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CacheError::Deserialization {
                key: key.to_string(),
                source,
            })
    }

    /// Remove `key` from both tiers. The local copy is dropped even when the
    /// remote call fails.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.local.delete(key);
        self.remote()?.del(&[key.to_string()]).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        if self.local.contains(key) {
            return Ok(true);
        }
        let found = self.remote()?.exists(&[key.to_string()]).await?;
        Ok(found > 0)
    }

    /// Store every entry in one pipeline.
    ///
    /// Entries that fail to serialize are skipped; the rest are written and
    /// the returned [`CacheError::Batch`] names each skipped key.
    pub async fn mset<V: Serialize>(
        &self,
        entries: &[(String, V)],
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        if !self.config.enabled || ttl_secs == 0 || entries.is_empty() {
            return Ok(());
        }
        let remote = self.remote()?;
        let ttl = Duration::from_secs(ttl_secs);

        let mut payloads = Vec::with_capacity(entries.len());
        let mut failures = Vec::new();
        for (key, value) in entries {
            match serde_json::to_string(value) {
                Ok(payload) => payloads.push((key.clone(), payload)),
                Err(err) => {
                    warn!(target: "strata::cache", key = %key, error = %err, "skipping value that failed to serialize");
                    failures.push(BatchFailure {
                        key: key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !payloads.is_empty() {
            remote.mset(&payloads, ttl).await?;
            for (key, payload) in payloads {
                if self.is_hot_key(&key) {
                    self.local.set(key, payload, ttl);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CacheError::Batch {
                failures: BatchFailures(failures),
            })
        }
    }

    /// Values for `keys` in input order; local hits skip the remote round trip.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut values = vec![None; keys.len()];
        if !self.config.enabled || keys.is_empty() {
            return Ok(values);
        }

        let mut pending = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            match self.lookup_local(key) {
                Some(value) => values[index] = Some(value),
                None => pending.push(index),
            }
        }
        if pending.is_empty() {
            return Ok(values);
        }

        let remote_keys: Vec<String> = pending.iter().map(|&index| keys[index].clone()).collect();
        let fetched = self.remote()?.mget(&remote_keys).await?;
        if fetched.len() != remote_keys.len() {
            return Err(RemoteError::protocol(format!(
                "mget returned {} values for {} keys",
                fetched.len(),
                remote_keys.len()
            ))
            .into());
        }

        for (index, value) in pending.into_iter().zip(fetched) {
            self.record_remote(&keys[index], value.as_ref());
            values[index] = value;
        }
        Ok(values)
    }

    /// Delete every key in one call. Returns how many existed remotely.
    pub async fn mdelete(&self, keys: &[String]) -> Result<u64, CacheError> {
        for key in keys {
            self.local.delete(key);
        }
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.remote()?.del(keys).await?)
    }

    pub async fn list_push(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        Ok(self.remote()?.lpush(key, values).await?)
    }

    pub async fn list_push_back(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        Ok(self.remote()?.rpush(key, values).await?)
    }

    pub async fn list_pop(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.remote()?.lpop(key).await?)
    }

    pub async fn list_pop_back(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.remote()?.rpop(key).await?)
    }

    /// Inclusive range; negative indexes count from the tail.
    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, CacheError> {
        Ok(self.remote()?.lrange(key, start, stop).await?)
    }

    pub async fn list_length(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.remote()?.llen(key).await?)
    }

    pub async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        Ok(self.remote()?.sadd(key, members).await?)
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.remote()?.smembers(key).await?)
    }

    pub async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        Ok(self.remote()?.sismember(key, member).await?)
    }

    pub async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        Ok(self.remote()?.srem(key, members).await?)
    }

    pub async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.increment_by(key, 1).await
    }

    /// Remote-authoritative counter; any stale local copy is dropped.
    pub async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.local.delete(key);
        Ok(self.remote()?.incr_by(key, delta).await?)
    }

    pub async fn decrement(&self, key: &str) -> Result<i64, CacheError> {
        self.decrement_by(key, 1).await
    }

    pub async fn decrement_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.local.delete(key);
        Ok(self.remote()?.decr_by(key, delta).await?)
    }

    /// Reset the remote TTL of `key`. Returns false when the key does not exist.
    pub async fn set_expiration(&self, key: &str, ttl_secs: u64) -> Result<bool, CacheError> {
        if ttl_secs == 0 {
            return Err(CacheError::InvalidTtl {
                key: key.to_string(),
            });
        }
        let remote = self.remote()?;
        // A local copy could otherwise outlive the shortened remote entry.
        self.local.delete(key);
        Ok(remote.expire(key, Duration::from_secs(ttl_secs)).await?)
    }

    pub async fn get_ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        Ok(self.remote()?.ttl(key).await?)
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.remote()?.keys(pattern).await?)
    }

    /// Delete every remote key matching the glob and every local entry that
    /// contains or matches it. Returns the number of remote keys removed.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        self.local.remove_matching(pattern);
        let remote = self.remote()?;
        let keys = remote.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = remote.del(&keys).await?;
        debug!(target: "strata::cache", pattern, removed, "deleted keys by pattern");
        Ok(removed)
    }

    /// Attempt to acquire `key` for `ttl_secs`. `Ok(None)` means another
    /// holder has it.
    pub async fn try_lock(
        &self,
        key: &str,
        ttl_secs: u64,
    ) -> Result<Option<DistributedLock>, CacheError> {
        if ttl_secs == 0 {
            return Err(CacheError::InvalidTtl {
                key: key.to_string(),
            });
        }
        let remote = self.remote()?;
        let token = new_lock_token();
        let ttl = Duration::from_secs(ttl_secs);

        if !remote.set_nx(&lock_key(key), &token, ttl).await? {
            debug!(target: "strata::cache::lock", key, "lock held elsewhere");
            return Ok(None);
        }
        debug!(target: "strata::cache::lock", key, ttl_secs, "lock acquired");
        Ok(Some(DistributedLock {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    /// Release `lock` if its token is still the one stored remotely.
    pub async fn release(&self, lock: &DistributedLock) -> Result<(), CacheError> {
        let remote = self.remote()?;
        if remote
            .compare_and_delete(&lock_key(&lock.key), &lock.token)
            .await?
        {
            debug!(target: "strata::cache::lock", key = %lock.key, "lock released");
            Ok(())
        } else {
            Err(CacheError::LockNotOwned {
                key: lock.key.clone(),
            })
        }
    }

    /// Acquire `key` on behalf of this service instance.
    ///
    /// The token is kept in a process-local record that expires with the lock,
    /// so [`unlock`](Self::unlock) must be called on the same instance.
    pub async fn lock(&self, key: &str, ttl_secs: u64) -> Result<bool, CacheError> {
        match self.try_lock(key, ttl_secs).await? {
            Some(lock) => {
                self.lock_tokens
                    .set(lock_record_key(key), lock.token, lock.ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn unlock(&self, key: &str) -> Result<(), CacheError> {
        let record = lock_record_key(key);
        let token = self
            .lock_tokens
            .get(&record)
            .ok_or_else(|| CacheError::LockNotHeld {
                key: key.to_string(),
            })?;

        let released = self
            .remote()?
            .compare_and_delete(&lock_key(key), &token)
            .await?;
        self.lock_tokens.delete(&record);

        if released {
            debug!(target: "strata::cache::lock", key, "lock released");
            Ok(())
        } else {
            Err(CacheError::LockNotOwned {
                key: key.to_string(),
            })
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        Ok(self.remote()?.ping().await?)
    }

    /// Drop everything in the remote database and in the local tiers.
    pub async fn flush_db(&self) -> Result<(), CacheError> {
        self.local.clear();
        self.lock_tokens.clear();
        Ok(self.remote()?.flush_db().await?)
    }

    /// Remote `INFO` as a `field -> value` map; section headers are skipped.
    pub async fn info(&self) -> Result<HashMap<String, String>, CacheError> {
        let raw = self.remote()?.info().await?;
        Ok(parse_info(&raw))
    }

    pub async fn db_size(&self) -> Result<u64, CacheError> {
        Ok(self.remote()?.db_size().await?)
    }

    /// Keyspace hit ratio reported by the remote store, 0.0 when there has
    /// been no lookup yet.
    pub async fn hit_rate(&self) -> Result<f64, CacheError> {
        let info = self.info().await?;
        let read = |field: &str| {
            info.get(field)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let hits = read("keyspace_hits");
        let misses = read("keyspace_misses");
        let total = hits + misses;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(hits as f64 / total as f64)
    }

    /// Remove expired local values and expired lock records.
    pub fn sweep(&self) {
        self.local.sweep();
        self.lock_tokens.sweep();
    }
}

fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn service() -> (Arc<MemoryStore>, CacheService) {
        let store = Arc::new(MemoryStore::new());
        let service = CacheService::new(store.clone(), CacheConfig::default());
        (store, service)
    }

    #[test]
    fn info_parsing_skips_headers_and_blank_lines() {
        let parsed = parse_info("# Stats\r\nkeyspace_hits:10\r\n\r\nkeyspace_misses:5\r\nrole:master\r\n");
        assert_eq!(parsed.get("keyspace_hits").map(String::as_str), Some("10"));
        assert_eq!(parsed.get("keyspace_misses").map(String::as_str), Some("5"));
        assert_eq!(parsed.get("role").map(String::as_str), Some("master"));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn lock_tokens_are_random_128_bit_hex() {
        let first = new_lock_token();
        let second = new_lock_token();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn hot_keys_are_served_locally_after_set() {
        let (store, service) = service();
        service
            .set("statistics:user:1:type:todo", &42_u32, 60)
            .await
            .unwrap();
        assert_eq!(service.local_len(), 1);

        // Prove the local tier answers by making the remote fail.
        store.set_available(false);
        let value: Option<u32> = service
            .get_object("statistics:user:1:type:todo")
            .await
            .unwrap();
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn cold_keys_never_enter_the_local_tier() {
        let (_store, service) = service();
        service.set("query:abc", &"v", 60).await.unwrap();
        assert_eq!(service.local_len(), 0);
        assert_eq!(
            service.get("query:abc").await.unwrap().as_deref(),
            Some("\"v\"")
        );
        assert_eq!(service.local_len(), 0);
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let service = CacheService::new(
            store.clone(),
            CacheConfig {
                enabled: false,
                ..Default::default()
            },
        );
        service.set("statistics:x", &1_u8, 60).await.unwrap();
        assert_eq!(store.db_size().await.unwrap(), 0);
        assert!(service.get("statistics:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disconnected_service_reports_unavailable() {
        let service = CacheService::disconnected(CacheConfig::default());
        assert!(!service.is_available());
        assert!(matches!(
            service.set("k", &1_u8, 10).await,
            Err(CacheError::Unavailable)
        ));
        assert!(matches!(
            service.get("k").await,
            Err(CacheError::Unavailable)
        ));
        assert!(matches!(
            service.lock("k", 10).await,
            Err(CacheError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn zero_ttl_lock_is_rejected() {
        let (_store, service) = service();
        assert!(matches!(
            service.lock("job", 0).await,
            Err(CacheError::InvalidTtl { .. })
        ));
    }

    #[tokio::test]
    async fn counters_drop_stale_local_copies() {
        let (_store, service) = service();
        service.set("user:7:visits", &5_i64, 60).await.unwrap();
        assert_eq!(service.increment_by("user:7:visits", 2).await.unwrap(), 7);
        assert_eq!(
            service.get_object::<i64>("user:7:visits").await.unwrap(),
            Some(7)
        );
    }

    #[tokio::test]
    async fn hit_rate_from_keyspace_stats() {
        let (_store, service) = service();
        assert_eq!(service.hit_rate().await.unwrap(), 0.0);

        service.set("query:a", &1_u8, 60).await.unwrap();
        service.get("query:a").await.unwrap();
        service.get("query:a").await.unwrap();
        service.get("query:a").await.unwrap();
        service.get("query:missing").await.unwrap();

        assert!((service.hit_rate().await.unwrap() - 0.75).abs() < f64::EPSILON);
    }
}
