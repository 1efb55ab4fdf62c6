use std::time::Duration;

use serde::Deserialize;

const DEFAULT_SLOW_QUERY_MS: u64 = 100;
const DEFAULT_LOCAL_MAX_ENTRIES: usize = 10_000;
const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BACKGROUND_WRITE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Settings consumed by [`QueryOptimizer`](super::QueryOptimizer).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Database executions slower than this are logged as slow queries.
    pub slow_query_ms: u64,
    /// Capacity of the local result tier.
    pub local_max_entries: usize,
    /// Upper bound for one database execution.
    pub statement_timeout_ms: u64,
    /// Upper bound for a detached remote cache write.
    pub background_write_timeout_ms: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            slow_query_ms: DEFAULT_SLOW_QUERY_MS,
            local_max_entries: DEFAULT_LOCAL_MAX_ENTRIES,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            background_write_timeout_ms: DEFAULT_BACKGROUND_WRITE_TIMEOUT_MS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

impl From<&crate::config::QuerySettings> for QueryConfig {
    fn from(settings: &crate::config::QuerySettings) -> Self {
        Self {
            slow_query_ms: u64::from(settings.slow_query_ms.get()),
            local_max_entries: settings.local_max_entries.get() as usize,
            statement_timeout_ms: u64::from(settings.statement_timeout_ms.get()),
            background_write_timeout_ms: u64::from(settings.background_write_timeout_ms.get()),
            sweep_interval_seconds: u64::from(settings.sweep_interval_seconds.get()),
        }
    }
}

impl QueryConfig {
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms.max(1))
    }

    pub fn background_write_timeout(&self) -> Duration {
        Duration::from_millis(self.background_write_timeout_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}
