//! Two-tier caching and query acceleration.
//!
//! - [`cache`]: process-local tier, remote tier contract, [`cache::CacheService`]
//!   and the distributed lock.
//! - [`query`]: [`query::QueryOptimizer`], memoized parameterized reads with
//!   prepared-statement reuse.
//! - [`application`]: typed per-subject result caching on top of the service.
//! - [`infra`]: Redis and Postgres adapters, telemetry.
//! - [`config`]: layered settings (file → env → CLI).

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod query;
