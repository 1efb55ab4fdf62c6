use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serde_json::json;
use serial_test::serial;
use strata::cache::{CacheConfig, CacheService, MemoryStore, Sweep};
use strata::query::{
    OptimizedQuery, QueryArg, QueryBackend, QueryConfig, QueryError, QueryOptimizer,
    QueryTransaction, Rows, StatementHandle,
};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

fn recorded_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

fn assert_recorded(expected: &[&str]) {
    let names = recorded_names();
    for metric in expected {
        assert!(names.contains(*metric), "missing metric: {metric}");
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    snapshotter();

    let cache = CacheService::new(
        Arc::new(MemoryStore::new()),
        CacheConfig {
            local_max_entries: 1,
            ..CacheConfig::default()
        },
    );

    // Local hit, then eviction once a second hot key arrives.
    cache.set("user:1", &1_u32, 60).await.expect("set");
    cache.get("user:1").await.expect("local hit");
    cache.set("user:2", &2_u32, 1).await.expect("set");

    // Local miss answered remotely, then a miss in both tiers.
    cache.get("user:1").await.expect("remote hit");
    cache.get("user:404").await.expect("miss");

    tokio::time::advance(Duration::from_secs(301)).await;
    Sweep::sweep(&cache);

    assert_recorded(&[
        "strata_cache_local_hit_total",
        "strata_cache_local_miss_total",
        "strata_cache_local_evict_total",
        "strata_cache_remote_hit_total",
        "strata_cache_remote_miss_total",
        "strata_cache_sweep_removed_total",
    ]);
}

struct SleepyBackend;

#[async_trait]
impl QueryBackend for SleepyBackend {
    async fn fetch_rows(
        &self,
        _sql: &str,
        _statement: &StatementHandle,
        _args: &[QueryArg],
    ) -> Result<Rows, QueryError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(vec![json!({ "id": 1 })])
    }

    async fn begin(&self) -> Result<Box<dyn QueryTransaction>, QueryError> {
        Err(QueryError::database("transactions are not scripted here"))
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn query_paths_emit_expected_metric_keys() {
    snapshotter();

    let cache = Arc::new(CacheService::new(
        Arc::new(MemoryStore::new()),
        CacheConfig::default(),
    ));
    let optimizer = QueryOptimizer::new(
        Arc::new(SleepyBackend),
        cache,
        QueryConfig {
            slow_query_ms: 10,
            ..QueryConfig::default()
        },
    );

    let query = OptimizedQuery::new("SELECT id FROM todos").remote_cache(false);
    for _ in 0..2 {
        let rows: Vec<serde_json::Value> = optimizer
            .execute_optimized_query(&query)
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
    }

    assert_recorded(&[
        "strata_query_db_ms",
        "strata_query_slow_total",
        "strata_query_cache_hit_total",
    ]);
}
