//! Redis implementation of [`RemoteStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, RedisResult, Script};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::{RemoteError, RemoteResult, RemoteStore};
use crate::config::RemoteSettings;

const METRIC_REMOTE_SLOW: &str = "strata_remote_slow_total";
const SCAN_BATCH: usize = 200;

/// Deletes the lock only while it still holds the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub slow_command: Duration,
}

impl From<&RemoteSettings> for RedisConfig {
    fn from(settings: &RemoteSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: Duration::from_millis(u64::from(settings.connect_timeout_ms.get())),
            command_timeout: Duration::from_millis(u64::from(settings.command_timeout_ms.get())),
            slow_command: Duration::from_millis(u64::from(settings.slow_command_ms.get())),
        }
    }
}

fn map_redis_error(err: RedisError) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout { command: "redis" };
    }
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        return RemoteError::unreachable(err.to_string());
    }
    match err.kind() {
        ErrorKind::TypeError => RemoteError::protocol(err.to_string()),
        _ => RemoteError::command(err.to_string()),
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisStore {
    conn: ConnectionManager,
    unlock: Script,
    command_timeout: Duration,
    slow_command: Duration,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> RemoteResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| RemoteError::unreachable(err.to_string()))?;
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RemoteError::Timeout { command: "CONNECT" })?
            .map_err(map_redis_error)?;

        let store = Self {
            conn,
            unlock: Script::new(UNLOCK_SCRIPT),
            command_timeout: config.command_timeout,
            slow_command: config.slow_command,
        };
        store.ping().await?;
        info!(target: "strata::infra::redis", "connected to redis");
        Ok(store)
    }

    async fn run<T>(
        &self,
        command: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> RemoteResult<T> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.command_timeout, fut).await;
        let elapsed = started.elapsed();

        if elapsed > self.slow_command {
            counter!(METRIC_REMOTE_SLOW, "command" => command).increment(1);
            warn!(
                target: "strata::infra::redis",
                command,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow redis command"
            );
        }

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_redis_error(err)),
            Err(_) => Err(RemoteError::Timeout { command }),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> RemoteResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        let _: () = self
            .run(
                "SET",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn mset(&self, entries: &[(String, String)], ttl: Duration) -> RemoteResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = self.run("MSET", pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GET").arg(key);
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = self.run("MGET", pipe.query_async(&mut conn)).await?;
        Ok(values)
    }

    async fn del(&self, keys: &[String]) -> RemoteResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await?;
        Ok(removed)
    }

    async fn exists(&self, keys: &[String]) -> RemoteResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let found: u64 = self
            .run("EXISTS", redis::cmd("EXISTS").arg(keys).query_async(&mut conn))
            .await?;
        Ok(found)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RemoteResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run(
                "PEXPIRE",
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> RemoteResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let remaining: i64 = self
            .run("PTTL", redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        // -2: missing key, -1: no expiry.
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> RemoteResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .run(
                "INCRBY",
                redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn),
            )
            .await?;
        Ok(value)
    }

    async fn decr_by(&self, key: &str, delta: i64) -> RemoteResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .run(
                "DECRBY",
                redis::cmd("DECRBY").arg(key).arg(delta).query_async(&mut conn),
            )
            .await?;
        Ok(value)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> RemoteResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .run(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> RemoteResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run(
                "EVALSHA",
                self.unlock.key(key).arg(expected).invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn keys(&self, pattern: &str) -> RemoteResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> RemoteResult<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut conn = self.conn.clone();
        let len: u64 = self
            .run(
                "LPUSH",
                redis::cmd("LPUSH").arg(key).arg(values).query_async(&mut conn),
            )
            .await?;
        Ok(len)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> RemoteResult<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut conn = self.conn.clone();
        let len: u64 = self
            .run(
                "RPUSH",
                redis::cmd("RPUSH").arg(key).arg(values).query_async(&mut conn),
            )
            .await?;
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> RemoteResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .run("LPOP", redis::cmd("LPOP").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn rpop(&self, key: &str) -> RemoteResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .run("RPOP", redis::cmd("RPOP").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> RemoteResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = self
            .run(
                "LRANGE",
                redis::cmd("LRANGE")
                    .arg(key)
                    .arg(start)
                    .arg(stop)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(values)
    }

    async fn llen(&self, key: &str) -> RemoteResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = self
            .run("LLEN", redis::cmd("LLEN").arg(key).query_async(&mut conn))
            .await?;
        Ok(len)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> RemoteResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let added: u64 = self
            .run(
                "SADD",
                redis::cmd("SADD").arg(key).arg(members).query_async(&mut conn),
            )
            .await?;
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> RemoteResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = self
            .run("SMEMBERS", redis::cmd("SMEMBERS").arg(key).query_async(&mut conn))
            .await?;
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> RemoteResult<bool> {
        let mut conn = self.conn.clone();
        let found: bool = self
            .run(
                "SISMEMBER",
                redis::cmd("SISMEMBER")
                    .arg(key)
                    .arg(member)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(found)
    }

    async fn srem(&self, key: &str, members: &[String]) -> RemoteResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run(
                "SREM",
                redis::cmd("SREM").arg(key).arg(members).query_async(&mut conn),
            )
            .await?;
        Ok(removed)
    }

    async fn ping(&self) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .run("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn flush_db(&self) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        let _: () = self
            .run("FLUSHDB", redis::cmd("FLUSHDB").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn info(&self) -> RemoteResult<String> {
        let mut conn = self.conn.clone();
        let info: String = self
            .run("INFO", redis::cmd("INFO").query_async(&mut conn))
            .await?;
        Ok(info)
    }

    async fn db_size(&self) -> RemoteResult<u64> {
        let mut conn = self.conn.clone();
        let size: u64 = self
            .run("DBSIZE", redis::cmd("DBSIZE").query_async(&mut conn))
            .await?;
        Ok(size)
    }
}
