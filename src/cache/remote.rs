//! Contract for the networked key-value tier.

use std::time::Duration;

use async_trait::async_trait;

use super::error::RemoteError;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Narrow client contract against the shared key-value store.
///
/// Every method is a single network round trip (or one pipelined batch) and
/// is bounded by the implementation's command timeout. `set_nx` and
/// `compare_and_delete` must be atomic on the server side.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> RemoteResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()>;

    /// Pipelined `SET ... EX` for every entry.
    async fn mset(&self, entries: &[(String, String)], ttl: Duration) -> RemoteResult<()>;

    /// Pipelined `GET` preserving input order.
    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<String>>>;

    /// Returns the number of keys removed.
    async fn del(&self, keys: &[String]) -> RemoteResult<u64>;

    /// Returns how many of `keys` exist.
    async fn exists(&self, keys: &[String]) -> RemoteResult<u64>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> RemoteResult<bool>;

    /// Remaining time to live; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> RemoteResult<Option<Duration>>;

    async fn incr_by(&self, key: &str, delta: i64) -> RemoteResult<i64>;

    async fn decr_by(&self, key: &str, delta: i64) -> RemoteResult<i64>;

    async fn incr(&self, key: &str) -> RemoteResult<i64> {
        self.incr_by(key, 1).await
    }

    async fn decr(&self, key: &str) -> RemoteResult<i64> {
        self.decr_by(key, 1).await
    }

    /// Atomic set-if-absent with expiry. True when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<bool>;

    /// Atomically delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> RemoteResult<bool>;

    /// Every key matching the glob `pattern`.
    async fn keys(&self, pattern: &str) -> RemoteResult<Vec<String>>;

    async fn lpush(&self, key: &str, values: &[String]) -> RemoteResult<u64>;

    async fn rpush(&self, key: &str, values: &[String]) -> RemoteResult<u64>;

    async fn lpop(&self, key: &str) -> RemoteResult<Option<String>>;

    async fn rpop(&self, key: &str) -> RemoteResult<Option<String>>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> RemoteResult<Vec<String>>;

    async fn llen(&self, key: &str) -> RemoteResult<u64>;

    async fn sadd(&self, key: &str, members: &[String]) -> RemoteResult<u64>;

    async fn smembers(&self, key: &str) -> RemoteResult<Vec<String>>;

    async fn sismember(&self, key: &str, member: &str) -> RemoteResult<bool>;

    async fn srem(&self, key: &str, members: &[String]) -> RemoteResult<u64>;

    async fn ping(&self) -> RemoteResult<()>;

    async fn flush_db(&self) -> RemoteResult<()>;

    /// Raw `INFO` text (`key:value` lines separated by CRLF).
    async fn info(&self) -> RemoteResult<String>;

    async fn db_size(&self) -> RemoteResult<u64>;
}
