//! Cache tier configuration.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_LOCAL_MAX_ENTRIES: usize = 10_000;
const DEFAULT_LOCAL_BACKFILL_TTL_SECONDS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_HOT_PREFIXES: [&str; 4] = ["statistics:", "trends:", "user:", "session:"];

/// Settings consumed by [`CacheService`](super::CacheService).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, value reads miss and value writes are skipped.
    pub enabled: bool,
    /// Keys starting with one of these prefixes are promoted to the local tier.
    pub hot_prefixes: Vec<String>,
    /// Capacity of each local tier.
    pub local_max_entries: usize,
    /// TTL given to local copies created from a remote hit.
    pub local_backfill_ttl_seconds: u64,
    /// Period of the background sweep of expired local entries.
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_prefixes: DEFAULT_HOT_PREFIXES.iter().map(|p| p.to_string()).collect(),
            local_max_entries: DEFAULT_LOCAL_MAX_ENTRIES,
            local_backfill_ttl_seconds: DEFAULT_LOCAL_BACKFILL_TTL_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            hot_prefixes: settings.hot_prefixes.clone(),
            local_max_entries: settings.local_max_entries.get() as usize,
            local_backfill_ttl_seconds: u64::from(settings.local_backfill_ttl_seconds.get()),
            sweep_interval_seconds: u64::from(settings.sweep_interval_seconds.get()),
        }
    }
}

impl CacheConfig {
    /// Pure prefix test against the configured allow-list.
    pub fn is_hot_key(&self, key: &str) -> bool {
        self.hot_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }

    pub fn local_backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.local_backfill_ttl_seconds.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.local_max_entries, 10_000);
        assert_eq!(config.local_backfill_ttl(), Duration::from_secs(300));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.hot_prefixes.len(), 4);
    }

    #[test]
    fn hot_key_classification() {
        let config = CacheConfig::default();
        assert!(config.is_hot_key("statistics:user:1:type:todo"));
        assert!(config.is_hot_key("trends:user:1:type:todo:days:7"));
        assert!(config.is_hot_key("session:abc"));
        assert!(config.is_hot_key("user:42"));
        assert!(!config.is_hot_key("query:0011223344556677"));
        assert!(!config.is_hot_key("lock:export:42"));
        assert!(!config.is_hot_key("users:42"));
    }

    #[test]
    fn empty_allow_list_has_no_hot_keys() {
        let config = CacheConfig {
            hot_prefixes: Vec::new(),
            ..Default::default()
        };
        assert!(!config.is_hot_key("statistics:user:1:type:todo"));
    }

    #[test]
    fn zero_durations_clamp_to_one_second() {
        let config = CacheConfig {
            local_backfill_ttl_seconds: 0,
            sweep_interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(config.local_backfill_ttl(), Duration::from_secs(1));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
