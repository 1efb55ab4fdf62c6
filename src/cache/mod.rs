//! Two-tier cache.
//!
//! - **Local tier**: [`LocalCache`], an expiring concurrent map inside the process.
//! - **Remote tier**: any [`RemoteStore`]; [`MemoryStore`] in-process or the
//!   Redis adapter in `infra::redis_store`.
//!
//! [`CacheService`] ties the two together and adds the distributed lock.
//!
//! ```toml
//! [cache]
//! enabled = true
//! hot_prefixes = ["statistics:", "trends:", "user:", "session:"]
//! local_max_entries = 10000
//! local_backfill_ttl_seconds = 300
//! sweep_interval_seconds = 60
//! ```

mod config;
mod error;
mod keys;
mod local;
pub(crate) mod lock;
mod memory;
mod pattern;
mod remote;
mod service;
mod sweeper;

pub use config::CacheConfig;
pub use error::{BatchFailure, BatchFailures, CacheError, RemoteError};
pub use keys::{CacheKey, ParamValue, lock_key, lock_record_key, normalize_sql, query_fingerprint};
pub use local::{LocalCache, LocalCacheItem};
pub use memory::MemoryStore;
pub use pattern::glob_match;
pub use remote::{RemoteResult, RemoteStore};
pub use service::{CacheService, DistributedLock};
pub use sweeper::{Sweep, Sweeper};
