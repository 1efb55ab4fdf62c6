//! Live tests against real Redis and Postgres instances.
//!
//! - Marked `#[ignore]`; run with `cargo test -- --ignored`.
//! - Redis URL from `STRATA_TEST_REDIS_URL`, Postgres URL from `DATABASE_URL`.
//! - Every Redis key written here lives under `strata-live:`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use strata::cache::{CacheConfig, CacheService, RemoteStore};
use strata::infra::db::{Database, PgQueryBackend, PoolConfig};
use strata::infra::redis_store::{RedisConfig, RedisStore};
use strata::query::{BatchQueryItem, OptimizedQuery, QueryArg, QueryConfig, QueryOptimizer};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn env(name: &str) -> TestResult<String> {
    std::env::var(name).map_err(|_| format!("{name} must be set for live tests").into())
}

async fn redis() -> TestResult<Arc<dyn RemoteStore>> {
    let config = RedisConfig {
        url: env("STRATA_TEST_REDIS_URL")?,
        connect_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
        slow_command: Duration::from_millis(100),
    };
    Ok(Arc::new(RedisStore::connect(&config).await?))
}

async fn database() -> TestResult<Database> {
    let config = PoolConfig {
        max_connections: 4,
        min_connections: 0,
        acquire_timeout: Duration::from_secs(10),
        idle_timeout: None,
        max_lifetime: None,
    };
    Ok(Database::connect(&env("DATABASE_URL")?, config).await?)
}

fn suffix() -> String {
    hex::encode(rand::random::<[u8; 6]>())
}

#[tokio::test]
#[ignore]
async fn live_redis_values_expire_and_patterns_delete() -> TestResult<()> {
    let cache = CacheService::new(redis().await?, CacheConfig::default());
    let base = format!("strata-live:{}", suffix());

    cache.set(&format!("{base}:a"), &[1, 2, 3], 60).await?;
    cache.set(&format!("{base}:b"), "text", 60).await?;
    let loaded: Option<Vec<u32>> = cache.get_object(&format!("{base}:a")).await?;
    assert_eq!(loaded, Some(vec![1, 2, 3]));

    let ttl = cache.get_ttl(&format!("{base}:a")).await?.ok_or("missing ttl")?;
    assert!(ttl <= Duration::from_secs(60));

    let removed = cache.delete_pattern(&format!("{base}:*")).await?;
    assert_eq!(removed, 2);
    assert!(!cache.exists(&format!("{base}:a")).await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn live_redis_lock_is_exclusive() -> TestResult<()> {
    let store = redis().await?;
    let first = CacheService::new(store.clone(), CacheConfig::default());
    let second = CacheService::new(store, CacheConfig::default());
    let key = format!("strata-live:export:{}", suffix());

    let held = first.try_lock(&key, 30).await?.ok_or("first caller should acquire")?;
    assert!(second.try_lock(&key, 30).await?.is_none());
    first.release(&held).await?;

    let next = second.try_lock(&key, 30).await?.ok_or("lock should be free")?;
    assert!(first.release(&held).await.is_err());
    second.release(&next).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn live_postgres_rows_decode_and_batches_commit() -> TestResult<()> {
    #[derive(Debug, Deserialize)]
    struct Row {
        n: i64,
        label: String,
    }

    let db = database().await?;
    db.health_check().await?;

    let cache = Arc::new(CacheService::disconnected(CacheConfig::default()));
    let optimizer = QueryOptimizer::new(
        Arc::new(PgQueryBackend::new(db.pool().clone())),
        cache,
        QueryConfig::default(),
    );

    let query = OptimizedQuery::new("SELECT $1::bigint AS n, $2::text AS label")
        .arg(41_i64)
        .arg("answer")
        .prepared(true);
    let rows: Vec<Row> = optimizer.execute_optimized_query(&query).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].n, 41);
    assert_eq!(rows[0].label, "answer");

    let items = vec![
        BatchQueryItem::new("SELECT 1 AS n", Vec::new(), Duration::from_secs(5)),
        BatchQueryItem::new(
            "SELECT $1::bigint AS n",
            vec![QueryArg::from(2_i64)],
            Duration::from_secs(5),
        ),
    ];
    let results = optimizer.execute_batch_queries(&items).await?;
    assert_eq!(results.len(), 2);
    assert_eq!(results[1][0]["n"], serde_json::json!(2));
    Ok(())
}
