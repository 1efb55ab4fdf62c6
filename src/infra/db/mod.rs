//! Postgres pool and query backend.

mod query;
mod util;

pub use query::PgQueryBackend;
pub use util::map_sqlx_error;

use std::time::Duration;

use metrics::gauge;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::config::DatabaseSettings;

use super::error::InfraError;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl From<&DatabaseSettings> for PoolConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            max_connections: settings.max_connections.get(),
            min_connections: settings.min_connections,
            acquire_timeout: Duration::from_secs(u64::from(settings.acquire_timeout_seconds.get())),
            idle_timeout: settings
                .idle_timeout_seconds
                .map(|secs| Duration::from_secs(u64::from(secs.get()))),
            max_lifetime: settings
                .max_lifetime_seconds
                .map(|secs| Duration::from_secs(u64::from(secs.get()))),
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_connections: u32,
    pub open_connections: u32,
    pub idle_connections: u32,
}

impl PoolStats {
    pub fn in_use(&self) -> u32 {
        self.open_connections.saturating_sub(self.idle_connections)
    }

    pub fn is_saturated(&self) -> bool {
        self.open_connections >= self.max_connections && self.idle_connections == 0
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    config: PoolConfig,
}

impl Database {
    pub async fn connect(url: &str, config: PoolConfig) -> Result<Self, InfraError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(url)
            .await
            .map_err(|err| InfraError::database(format!("failed to connect: {err}")))?;

        info!(
            target: "strata::infra::db",
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "database pool configured"
        );
        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_connections: self.config.max_connections,
            open_connections: self.pool.size(),
            idle_connections: u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX),
        }
    }

    /// Round-trip `SELECT 1` and report pool occupancy; warns when saturated.
    pub async fn health_check(&self) -> Result<PoolStats, InfraError> {
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| InfraError::database("health check timed out"))?
            .map_err(InfraError::from)?;

        let stats = self.stats();
        gauge!("strata_db_pool_connections").set(f64::from(stats.open_connections));
        gauge!("strata_db_pool_idle").set(f64::from(stats.idle_connections));
        if stats.is_saturated() {
            warn!(
                target: "strata::infra::db",
                open = stats.open_connections,
                max = stats.max_connections,
                "database pool at maximum capacity"
            );
        }
        Ok(stats)
    }
}
