//! Cached execution of parameterized reads.
//!
//! Lookup order is local results → remote cache → database. Fresh database
//! rows are written back to every tier the query enabled; the remote write
//! runs detached under its own timeout so it never delays the caller.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::args::{QueryArg, render_args};
use super::backend::{QueryBackend, QueryTransaction, Rows};
use super::config::QueryConfig;
use super::error::QueryError;
use super::statements::{StatementHandle, StatementRegistry};
use crate::cache::{CacheService, LocalCache, Sweep, query_fingerprint};

const METRIC_DB_MS: &str = "strata_query_db_ms";
const METRIC_SLOW: &str = "strata_query_slow_total";
const METRIC_CACHE_HIT: &str = "strata_query_cache_hit_total";

const LOGGED_SQL_CHARS: usize = 100;
const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(300);

/// Rows memoized in the optimizer's local tier.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub data: Arc<Rows>,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl QueryResult {
    fn new(data: Arc<Rows>, ttl: Duration) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Matches the expiry of the local tier holding it: strictly after `ttl`.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// One read and how it may be cached.
#[derive(Debug, Clone)]
pub struct OptimizedQuery {
    pub sql: String,
    pub args: Vec<QueryArg>,
    /// Overrides the fingerprint key.
    pub cache_key: Option<String>,
    /// Zero disables write-back.
    pub cache_ttl: Duration,
    pub use_local_cache: bool,
    pub use_remote_cache: bool,
    /// Register the statement shape so the backend can keep it prepared.
    pub prepare: bool,
}

impl OptimizedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            cache_key: None,
            cache_ttl: DEFAULT_QUERY_TTL,
            use_local_cache: true,
            use_remote_cache: true,
            prepare: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<QueryArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn local_cache(mut self, enabled: bool) -> Self {
        self.use_local_cache = enabled;
        self
    }

    pub fn remote_cache(mut self, enabled: bool) -> Self {
        self.use_remote_cache = enabled;
        self
    }

    pub fn prepared(mut self, enabled: bool) -> Self {
        self.prepare = enabled;
        self
    }

    /// The explicit key, or `query:<16 hex>` derived from SQL and arguments.
    pub fn resolved_key(&self) -> String {
        match &self.cache_key {
            Some(key) => key.clone(),
            None => query_fingerprint(&self.sql, &render_args(&self.args)),
        }
    }
}

/// Item of [`QueryOptimizer::execute_batch_queries`]; always uses both tiers
/// and a registered statement.
#[derive(Debug, Clone)]
pub struct BatchQueryItem {
    pub sql: String,
    pub args: Vec<QueryArg>,
    pub cache_key: Option<String>,
    pub cache_ttl: Duration,
}

impl BatchQueryItem {
    pub fn new(sql: impl Into<String>, args: Vec<QueryArg>, cache_ttl: Duration) -> Self {
        Self {
            sql: sql.into(),
            args,
            cache_key: None,
            cache_ttl,
        }
    }

    fn to_query(&self) -> OptimizedQuery {
        OptimizedQuery {
            sql: self.sql.clone(),
            args: self.args.clone(),
            cache_key: self.cache_key.clone(),
            cache_ttl: self.cache_ttl,
            use_local_cache: true,
            use_remote_cache: true,
            prepare: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStats {
    pub local_cache_entries: usize,
    pub prepared_statements: usize,
}

/// Decode rows into `T`, producing fresh values on every call.
pub fn decode_rows<T: DeserializeOwned>(rows: &Rows) -> Result<Vec<T>, QueryError> {
    rows.iter()
        .map(|row| T::deserialize(row))
        .collect::<Result<Vec<T>, _>>()
        .map_err(QueryError::Decode)
}

fn truncate_sql(sql: &str) -> String {
    if sql.chars().count() <= LOGGED_SQL_CHARS {
        return sql.to_string();
    }
    let mut truncated: String = sql.chars().take(LOGGED_SQL_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}

/// Remote TTLs have whole-second resolution; round up so nothing becomes zero.
fn remote_ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

pub struct QueryOptimizer {
    backend: Arc<dyn QueryBackend>,
    cache: Arc<CacheService>,
    results: LocalCache<QueryResult>,
    statements: StatementRegistry,
    config: QueryConfig,
}

impl QueryOptimizer {
    pub fn new(backend: Arc<dyn QueryBackend>, cache: Arc<CacheService>, config: QueryConfig) -> Self {
        Self {
            backend,
            cache,
            results: LocalCache::new("query", config.local_max_entries),
            statements: StatementRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn statements(&self) -> &StatementRegistry {
        &self.statements
    }

    pub async fn execute_optimized_query<T: DeserializeOwned>(
        &self,
        query: &OptimizedQuery,
    ) -> Result<Vec<T>, QueryError> {
        let rows = self.run(query, None).await?;
        decode_rows(&rows)
    }

    /// Run every item in one transaction, in order.
    ///
    /// A failure rolls the transaction back and reports the failing index.
    /// Cache entries written for earlier items stay in place.
    pub async fn execute_batch_queries(
        &self,
        items: &[BatchQueryItem],
    ) -> Result<Vec<Arc<Rows>>, QueryError> {
        let mut tx = self.backend.begin().await?;
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            match self.run(&item.to_query(), Some(&mut tx)).await {
                Ok(rows) => results.push(rows),
                Err(source) => {
                    if let Err(err) = tx.rollback().await {
                        warn!(target: "strata::query", index, error = %err, "batch rollback failed");
                    }
                    return Err(QueryError::Batch {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(results)
    }

    /// Drop local results whose key contains or matches `pattern`, then
    /// pattern-delete remotely. Returns the number of remote keys removed.
    pub async fn invalidate_cache(&self, pattern: &str) -> Result<u64, QueryError> {
        self.results.remove_matching(pattern);
        Ok(self.cache.delete_pattern(pattern).await?)
    }

    /// Remove expired local results; returns how many were dropped.
    pub fn clean_expired_cache(&self) -> usize {
        self.results.sweep()
    }

    pub fn stats(&self) -> QueryStats {
        QueryStats {
            local_cache_entries: self.results.len(),
            prepared_statements: self.statements.len(),
        }
    }

    async fn run(
        &self,
        query: &OptimizedQuery,
        tx: Option<&mut Box<dyn QueryTransaction>>,
    ) -> Result<Arc<Rows>, QueryError> {
        let key = query.resolved_key();

        if query.use_local_cache {
            if let Some(rows) = self.local_rows(&key) {
                counter!(METRIC_CACHE_HIT, "tier" => "local").increment(1);
                return Ok(rows);
            }
        }

        if query.use_remote_cache {
            match self.cache.get_object::<Rows>(&key).await {
                Ok(Some(rows)) => {
                    counter!(METRIC_CACHE_HIT, "tier" => "remote").increment(1);
                    let rows = Arc::new(rows);
                    if query.use_local_cache && !query.cache_ttl.is_zero() {
                        self.store_local(&key, rows.clone(), query.cache_ttl);
                    }
                    return Ok(rows);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "strata::query", key = %key, error = %err, "query cache read failed, using database");
                }
            }
        }

        let rows = Arc::new(self.fetch_from_database(query, tx).await?);

        if !query.cache_ttl.is_zero() {
            if query.use_local_cache {
                self.store_local(&key, rows.clone(), query.cache_ttl);
            }
            if query.use_remote_cache {
                self.spawn_remote_write(key, rows.clone(), query.cache_ttl);
            }
        }
        Ok(rows)
    }

    async fn fetch_from_database(
        &self,
        query: &OptimizedQuery,
        tx: Option<&mut Box<dyn QueryTransaction>>,
    ) -> Result<Rows, QueryError> {
        let handle = if query.prepare {
            self.statements.get_or_register(&query.sql)
        } else {
            Arc::new(StatementHandle::ad_hoc(&query.sql))
        };
        let backend = &self.backend;
        let sql = query.sql.as_str();
        let args = query.args.as_slice();
        let statement = handle.as_ref();

        let started = Instant::now();
        let fetch = async move {
            match tx {
                Some(tx) => tx.fetch_rows(sql, statement, args).await,
                None => backend.fetch_rows(sql, statement, args).await,
            }
        };
        let timeout = self.config.statement_timeout();
        let result = tokio::time::timeout(timeout, fetch).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let rows = match result {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                warn!(target: "strata::query", sql = %truncate_sql(&query.sql), error = %err, "database query failed");
                return Err(err);
            }
            Err(_) => {
                warn!(target: "strata::query", sql = %truncate_sql(&query.sql), elapsed_ms, "database query timed out");
                return Err(QueryError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                });
            }
        };

        histogram!(METRIC_DB_MS).record(elapsed.as_secs_f64() * 1000.0);
        if elapsed > self.config.slow_query_threshold() {
            counter!(METRIC_SLOW).increment(1);
            warn!(
                target: "strata::query",
                sql = %truncate_sql(&query.sql),
                elapsed_ms,
                args = query.args.len(),
                "slow query"
            );
        } else {
            debug!(
                target: "strata::query",
                sql = %truncate_sql(&query.sql),
                elapsed_ms,
                args = query.args.len(),
                "query executed"
            );
        }
        Ok(rows)
    }

    fn local_rows(&self, key: &str) -> Option<Arc<Rows>> {
        self.results.get(key).map(|result| result.data)
    }

    fn store_local(&self, key: &str, rows: Arc<Rows>, ttl: Duration) {
        self.results.set(key, QueryResult::new(rows, ttl), ttl);
    }

    fn spawn_remote_write(&self, key: String, rows: Arc<Rows>, ttl: Duration) {
        let cache = self.cache.clone();
        let limit = self.config.background_write_timeout();
        let ttl_secs = remote_ttl_secs(ttl);

        tokio::spawn(async move {
            match tokio::time::timeout(limit, cache.set(&key, rows.as_ref(), ttl_secs)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(target: "strata::query", key = %key, error = %err, "failed to cache query result");
                }
                Err(_) => {
                    warn!(
                        target: "strata::query",
                        key = %key,
                        timeout_ms = limit.as_millis() as u64,
                        "caching query result timed out"
                    );
                }
            }
        });
    }
}

impl Sweep for QueryOptimizer {
    fn sweep(&self) {
        let removed = self.clean_expired_cache();
        if removed > 0 {
            debug!(target: "strata::query", removed, "expired query results removed");
        }
    }
}
