//! Application services built on the cache and query layers.

pub mod error;
pub mod result_cache;

pub use result_cache::{
    ResultCache, ResultCacheConfig, ResultFamily, ResultKind, WarmupReport,
};
