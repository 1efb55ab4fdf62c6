//! CacheService behaviour against the in-process remote store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata::cache::{CacheConfig, CacheError, CacheService, MemoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TodoStats {
    total: u32,
    done: u32,
    ratio: f64,
}

fn sample() -> TodoStats {
    TodoStats {
        total: 12,
        done: 9,
        ratio: 0.75,
    }
}

fn service() -> (Arc<MemoryStore>, CacheService) {
    let store = Arc::new(MemoryStore::new());
    let service = CacheService::new(store.clone(), CacheConfig::default());
    (store, service)
}

#[tokio::test]
async fn stored_objects_round_trip() {
    let (_, cache) = service();

    cache
        .set("report:7", &sample(), 60)
        .await
        .expect("set should succeed");
    let loaded: Option<TodoStats> = cache.get_object("report:7").await.expect("get");

    assert_eq!(loaded, Some(sample()));
    assert!(cache.exists("report:7").await.expect("exists"));
}

#[tokio::test]
async fn missing_key_reads_as_none() {
    let (_, cache) = service();
    let loaded: Option<TodoStats> = cache.get_object("report:404").await.expect("get");
    assert!(loaded.is_none());
}

#[tokio::test]
async fn undecodable_value_reports_its_key() {
    let (_, cache) = service();
    cache.set("report:1", "plain text", 60).await.expect("set");

    let err = cache
        .get_object::<TodoStats>("report:1")
        .await
        .expect_err("shape mismatch");
    assert!(matches!(err, CacheError::Deserialization { ref key, .. } if key == "report:1"));
}

#[tokio::test(start_paused = true)]
async fn trend_entry_lives_for_exactly_its_ttl() {
    let (_, cache) = service();
    let key = "trends:user:42:type:todo";

    cache.set(key, &sample(), 600).await.expect("set");
    let ttl = cache
        .get_ttl(key)
        .await
        .expect("ttl")
        .expect("key should carry a ttl");
    assert!(ttl <= Duration::from_secs(600));
    assert!(ttl > Duration::from_secs(599));

    tokio::time::advance(Duration::from_secs(599)).await;
    let loaded: Option<TodoStats> = cache.get_object(key).await.expect("get");
    assert_eq!(loaded, Some(sample()));

    tokio::time::advance(Duration::from_secs(2)).await;
    let loaded: Option<TodoStats> = cache.get_object(key).await.expect("get");
    assert!(loaded.is_none());
    assert!(!cache.exists(key).await.expect("exists"));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_, cache) = service();
    cache
        .set("statistics:user:1:type:todo", &sample(), 60)
        .await
        .expect("set");

    cache
        .delete("statistics:user:1:type:todo")
        .await
        .expect("first delete");
    cache
        .delete("statistics:user:1:type:todo")
        .await
        .expect("second delete");

    assert!(
        cache
            .get("statistics:user:1:type:todo")
            .await
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn batch_write_isolates_unserializable_entries() {
    let (_, cache) = service();

    // Maps with non-string keys cannot be encoded as JSON objects.
    let mut broken = BTreeMap::new();
    broken.insert(vec![1_u8, 2], 3_u32);
    let entries = vec![
        ("batch:a".to_string(), BTreeMap::new()),
        ("batch:b".to_string(), broken),
        ("batch:c".to_string(), BTreeMap::new()),
    ];

    let err = cache
        .mset(&entries, 60)
        .await
        .expect_err("one entry cannot be serialized");
    match err {
        CacheError::Batch { failures } => {
            assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["batch:b"]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let values = cache
        .mget(&[
            "batch:a".to_string(),
            "batch:b".to_string(),
            "batch:c".to_string(),
        ])
        .await
        .expect("mget");
    assert_eq!(
        values,
        vec![Some("{}".to_string()), None, Some("{}".to_string())]
    );
}

#[tokio::test]
async fn mget_preserves_input_order() {
    let (_, cache) = service();
    cache
        .mset(
            &[
                ("user:1".to_string(), 1_u32),
                ("user:3".to_string(), 3_u32),
            ],
            60,
        )
        .await
        .expect("mset");

    let values = cache
        .mget(&[
            "user:3".to_string(),
            "user:2".to_string(),
            "user:1".to_string(),
        ])
        .await
        .expect("mget");
    assert_eq!(
        values,
        vec![Some("3".to_string()), None, Some("1".to_string())]
    );

    let removed = cache
        .mdelete(&["user:1".to_string(), "user:2".to_string()])
        .await
        .expect("mdelete");
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn pattern_invalidation_spares_other_subjects() {
    let (_, cache) = service();
    for key in [
        "statistics:user:1:type:todo",
        "trends:user:1:type:todo:days:7",
        "statistics:user:2:type:todo",
    ] {
        cache.set(key, &sample(), 300).await.expect("set");
    }
    assert_eq!(cache.local_len(), 3);

    let removed = cache.delete_pattern("*:user:1:*").await.expect("delete");
    assert_eq!(removed, 2);

    assert!(
        cache
            .get("statistics:user:1:type:todo")
            .await
            .expect("get")
            .is_none()
    );
    assert!(
        cache
            .get("trends:user:1:type:todo:days:7")
            .await
            .expect("get")
            .is_none()
    );
    assert!(
        cache
            .get("statistics:user:2:type:todo")
            .await
            .expect("get")
            .is_some()
    );
    assert_eq!(
        cache.keys("statistics:*").await.expect("keys"),
        vec!["statistics:user:2:type:todo".to_string()]
    );
}

#[tokio::test]
async fn lists_sets_and_counters() {
    let (_, cache) = service();

    cache
        .list_push("queue", &["b".to_string(), "a".to_string()])
        .await
        .expect("lpush");
    cache
        .list_push_back("queue", &["c".to_string()])
        .await
        .expect("rpush");
    assert_eq!(
        cache.list_range("queue", 0, -1).await.expect("lrange"),
        vec!["a", "b", "c"]
    );
    assert_eq!(cache.list_length("queue").await.expect("llen"), 3);
    assert_eq!(
        cache.list_pop("queue").await.expect("lpop"),
        Some("a".to_string())
    );
    assert_eq!(
        cache.list_pop_back("queue").await.expect("rpop"),
        Some("c".to_string())
    );

    let added = cache
        .set_add("tags", &["x".to_string(), "y".to_string(), "x".to_string()])
        .await
        .expect("sadd");
    assert_eq!(added, 2);
    assert!(cache.set_is_member("tags", "y").await.expect("sismember"));
    cache
        .set_remove("tags", &["y".to_string()])
        .await
        .expect("srem");
    assert_eq!(cache.set_members("tags").await.expect("smembers"), vec!["x"]);

    assert_eq!(cache.increment("hits").await.expect("incr"), 1);
    assert_eq!(cache.increment_by("hits", 4).await.expect("incrby"), 5);
    assert_eq!(cache.decrement("hits").await.expect("decr"), 4);
    assert_eq!(cache.decrement_by("hits", 10).await.expect("decrby"), -6);
}

#[tokio::test]
async fn expiration_updates_require_a_positive_ttl() {
    let (_, cache) = service();
    cache.set("report:1", &sample(), 60).await.expect("set");

    assert!(matches!(
        cache.set_expiration("report:1", 0).await,
        Err(CacheError::InvalidTtl { .. })
    ));
    assert!(cache.set_expiration("report:1", 5).await.expect("expire"));
    assert!(!cache.set_expiration("report:2", 5).await.expect("expire"));
    let ttl = cache.get_ttl("report:1").await.expect("ttl").expect("ttl set");
    assert!(ttl <= Duration::from_secs(5));
}

#[tokio::test]
async fn hot_values_survive_a_remote_outage_locally() {
    let (store, cache) = service();
    cache
        .set("session:abc", &sample(), 60)
        .await
        .expect("set hot");
    cache.set("report:1", &sample(), 60).await.expect("set cold");

    store.set_available(false);

    let hot: Option<TodoStats> = cache.get_object("session:abc").await.expect("local hit");
    assert_eq!(hot, Some(sample()));

    let err = cache.get("report:1").await.expect_err("remote down");
    assert!(err.is_unavailable());
}

#[tokio::test(start_paused = true)]
async fn remote_hits_on_hot_keys_backfill_locally_for_a_bounded_time() {
    let store = Arc::new(MemoryStore::new());
    let writer = CacheService::new(store.clone(), CacheConfig::default());
    let reader = CacheService::new(store.clone(), CacheConfig::default());

    writer
        .set("statistics:user:9:type:todo", &sample(), 3_600)
        .await
        .expect("set");
    assert_eq!(reader.local_len(), 0);

    let remote: Option<TodoStats> = reader
        .get_object("statistics:user:9:type:todo")
        .await
        .expect("remote hit");
    assert_eq!(remote, Some(sample()));
    assert_eq!(reader.local_len(), 1);

    // Served from the backfilled copy while the remote tier is down.
    store.set_available(false);
    let local: Option<TodoStats> = reader
        .get_object("statistics:user:9:type:todo")
        .await
        .expect("local hit");
    assert_eq!(local, Some(sample()));

    let backfill = reader.config().local_backfill_ttl();
    tokio::time::advance(backfill + Duration::from_secs(1)).await;
    let err = reader
        .get("statistics:user:9:type:todo")
        .await
        .expect_err("local copy is gone after the backfill bound");
    assert!(err.is_unavailable());
    assert_eq!(reader.local_len(), 0);
}

#[tokio::test]
async fn delete_drops_the_local_copy_even_when_the_remote_fails() {
    let (store, cache) = service();
    cache
        .set("session:abc", &sample(), 60)
        .await
        .expect("set hot");
    assert_eq!(cache.local_len(), 1);

    store.set_available(false);
    let err = cache.delete("session:abc").await.expect_err("remote down");
    assert!(err.is_unavailable());
    assert_eq!(cache.local_len(), 0);

    store.set_available(true);
    let remaining: Option<TodoStats> = cache.get_object("session:abc").await.expect("get");
    assert_eq!(remaining, Some(sample()), "the remote copy was never deleted");
    assert_eq!(cache.local_len(), 1, "read backfills from the remote again");
}

#[tokio::test]
async fn admin_operations_report_keyspace_state() {
    let (_, cache) = service();
    cache.ping().await.expect("ping");
    cache.set("report:1", &sample(), 60).await.expect("set");
    cache.set("report:2", &sample(), 60).await.expect("set");
    assert_eq!(cache.db_size().await.expect("dbsize"), 2);

    let info = cache.info().await.expect("info");
    assert!(info.contains_key("keyspace_hits"));

    cache.flush_db().await.expect("flush");
    assert_eq!(cache.db_size().await.expect("dbsize"), 0);
    assert_eq!(cache.local_len(), 0);
}
