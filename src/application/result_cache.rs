//! Per-subject aggregate and trend results on top of [`CacheService`].
//!
//! Aggregates live under `statistics:user:<id>:type:<kind>`, trends under
//! `trends:user:<id>:type:<kind>:days:<n>`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheKey, CacheService, ParamValue};

const DEFAULT_AGGREGATE_TTL_SECS: u64 = 300;
const DEFAULT_TREND_TTL_SECS: u64 = 600;
const DEFAULT_TREND_WINDOWS: [u32; 3] = [7, 30, 90];
const TREND_WINDOW_PARAM: &str = "days";

/// Namespace of a cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultFamily {
    Aggregate,
    Trend,
}

impl ResultFamily {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Aggregate => "statistics",
            Self::Trend => "trends",
        }
    }
}

/// Data kind a result was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Todo,
    Article,
}

impl ResultKind {
    pub const ALL: [ResultKind; 2] = [ResultKind::Todo, ResultKind::Article];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Article => "article",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "todo" => Ok(Self::Todo),
            "article" => Ok(Self::Article),
            other => Err(format!("unknown result kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    pub aggregate_ttl_secs: u64,
    pub trend_ttl_secs: u64,
    /// Trend windows checked by [`ResultCache::warmup`].
    pub trend_windows: Vec<u32>,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            aggregate_ttl_secs: DEFAULT_AGGREGATE_TTL_SECS,
            trend_ttl_secs: DEFAULT_TREND_TTL_SECS,
            trend_windows: DEFAULT_TREND_WINDOWS.to_vec(),
        }
    }
}

impl From<&crate::config::ResultsSettings> for ResultCacheConfig {
    fn from(settings: &crate::config::ResultsSettings) -> Self {
        Self {
            aggregate_ttl_secs: u64::from(settings.aggregate_ttl_seconds.get()),
            trend_ttl_secs: u64::from(settings.trend_ttl_seconds.get()),
            trend_windows: settings.trend_windows.clone(),
        }
    }
}

/// Outcome of [`ResultCache::warmup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub checked: usize,
    /// Keys with no cached value, in check order.
    pub missing: Vec<String>,
}

impl WarmupReport {
    pub fn is_warm(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Clone)]
pub struct ResultCache {
    cache: Arc<CacheService>,
    config: ResultCacheConfig,
}

impl ResultCache {
    pub fn new(cache: Arc<CacheService>, config: ResultCacheConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &ResultCacheConfig {
        &self.config
    }

    pub fn cache_key(
        family: ResultFamily,
        subject_id: u64,
        kind: ResultKind,
        params: &[(&str, ParamValue)],
    ) -> String {
        params
            .iter()
            .fold(
                CacheKey::new(family.prefix(), subject_id, kind.as_str()),
                |key, (name, value)| key.with_param(*name, value.clone()),
            )
            .generate()
    }

    pub fn aggregate_key(subject_id: u64, kind: ResultKind) -> String {
        Self::cache_key(ResultFamily::Aggregate, subject_id, kind, &[])
    }

    pub fn trend_key(subject_id: u64, kind: ResultKind, days: u32) -> String {
        Self::cache_key(
            ResultFamily::Trend,
            subject_id,
            kind,
            &[(TREND_WINDOW_PARAM, ParamValue::from(days))],
        )
    }

    pub async fn get_cached_aggregate<T: DeserializeOwned>(
        &self,
        subject_id: u64,
        kind: ResultKind,
    ) -> Result<Option<T>, CacheError> {
        self.cache
            .get_object(&Self::aggregate_key(subject_id, kind))
            .await
    }

    pub async fn set_cached_aggregate<T: Serialize + ?Sized>(
        &self,
        subject_id: u64,
        kind: ResultKind,
        data: &T,
    ) -> Result<(), CacheError> {
        self.cache
            .set(
                &Self::aggregate_key(subject_id, kind),
                data,
                self.config.aggregate_ttl_secs,
            )
            .await
    }

    pub async fn get_cached_trend<T: DeserializeOwned>(
        &self,
        subject_id: u64,
        kind: ResultKind,
        days: u32,
    ) -> Result<Option<T>, CacheError> {
        self.cache
            .get_object(&Self::trend_key(subject_id, kind, days))
            .await
    }

    pub async fn set_cached_trend<T: Serialize + ?Sized>(
        &self,
        subject_id: u64,
        kind: ResultKind,
        days: u32,
        data: &T,
    ) -> Result<(), CacheError> {
        self.cache
            .set(
                &Self::trend_key(subject_id, kind, days),
                data,
                self.config.trend_ttl_secs,
            )
            .await
    }

    /// Drop every aggregate and trend cached for `subject_id`.
    pub async fn invalidate_subject(&self, subject_id: u64) -> Result<u64, CacheError> {
        let mut removed = 0;
        for family in [ResultFamily::Aggregate, ResultFamily::Trend] {
            let pattern = CacheKey::subject_pattern(family.prefix(), subject_id);
            removed += self.cache.delete_pattern(&pattern).await?;
        }
        info!(target: "strata::results", subject_id, removed, "invalidated cached results");
        Ok(removed)
    }

    /// Check every known aggregate and trend key for `subject_id` concurrently
    /// and report the ones that need recomputation.
    ///
    /// A key whose check fails is reported as missing.
    pub async fn warmup(&self, subject_id: u64) -> Result<WarmupReport, CacheError> {
        if !self.cache.is_available() {
            return Err(CacheError::Unavailable);
        }

        let keys = self.working_set(subject_id);
        let checks = keys.iter().map(|key| async move {
            match self.cache.exists(key).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(target: "strata::results", key = %key, error = %err, "warmup check failed");
                    false
                }
            }
        });
        let found = join_all(checks).await;

        let missing: Vec<String> = keys
            .iter()
            .zip(found)
            .filter(|(_, found)| !found)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &missing {
            debug!(target: "strata::results", key = %key, "cache warmup needed");
        }

        Ok(WarmupReport {
            checked: keys.len(),
            missing,
        })
    }

    /// Keyspace hit ratio of the remote store.
    pub async fn hit_rate(&self) -> Result<f64, CacheError> {
        self.cache.hit_rate().await
    }

    fn working_set(&self, subject_id: u64) -> Vec<String> {
        let mut keys = Vec::with_capacity(ResultKind::ALL.len() * (1 + self.config.trend_windows.len()));
        for kind in ResultKind::ALL {
            keys.push(Self::aggregate_key(subject_id, kind));
            for &days in &self.config.trend_windows {
                keys.push(Self::trend_key(subject_id, kind, days));
            }
        }
        keys
    }
}
