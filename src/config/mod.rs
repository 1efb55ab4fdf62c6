//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "strata";
const ENV_PREFIX: &str = "STRATA";
const DEFAULT_REMOTE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_REMOTE_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REMOTE_COMMAND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REMOTE_SLOW_COMMAND_MS: u64 = 100;
const DEFAULT_DB_MAX_CONNECTIONS: u64 = 50;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 10;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DB_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DB_MAX_LIFETIME_SECS: u64 = 1_800;
const DEFAULT_HOT_PREFIXES: [&str; 4] = ["statistics:", "trends:", "user:", "session:"];
const DEFAULT_LOCAL_MAX_ENTRIES: u64 = 10_000;
const DEFAULT_LOCAL_BACKFILL_TTL_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_SLOW_QUERY_MS: u64 = 100;
const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BACKGROUND_WRITE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_AGGREGATE_TTL_SECS: u64 = 300;
const DEFAULT_TREND_TTL_SECS: u64 = 600;
const DEFAULT_TREND_WINDOWS: [u32; 3] = [7, 30, 90];

/// Command-line arguments for the strata binary.
#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Two-tier cache and query accelerator")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STRATA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Build the services and run periodic sweeps until interrupted.
    Serve,
    /// Ping the remote store and the database.
    Health,
    /// Print remote keyspace statistics.
    Info,
    /// Remove every key from the remote store.
    Flush(FlushArgs),
    /// Report which cached results of a subject need recomputation.
    Warmup(WarmupArgs),
    /// Drop cached results by subject or by key pattern.
    Invalidate(InvalidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct FlushArgs {
    /// Confirm the flush; nothing is removed without it.
    #[arg(long)]
    pub yes: bool,
}

#[derive(Debug, Args, Clone)]
pub struct WarmupArgs {
    #[arg(long, value_name = "ID")]
    pub subject: u64,
}

#[derive(Debug, Args, Clone)]
#[group(required = true, multiple = false)]
pub struct InvalidateArgs {
    /// Drop every aggregate and trend of this subject.
    #[arg(long, value_name = "ID")]
    pub subject: Option<u64>,

    /// Drop every key matching this glob pattern.
    #[arg(long, value_name = "GLOB")]
    pub pattern: Option<String>,
}

/// Flags applied on top of file and environment sources, for every command.
#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the log level (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Force JSON logging output.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the remote store URL.
    #[arg(long = "remote-url", value_name = "URL", global = true)]
    pub remote_url: Option<String>,

    /// Override the remote backend (redis, memory, disabled).
    #[arg(long = "remote-backend", value_name = "BACKEND", global = true)]
    pub remote_backend: Option<String>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub remote: RemoteSettings,
    pub cache: CacheSettings,
    pub query: QuerySettings,
    pub results: ResultsSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: NonZeroU32,
    pub idle_timeout_seconds: Option<NonZeroU32>,
    pub max_lifetime_seconds: Option<NonZeroU32>,
}

/// Which implementation backs the remote tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBackend {
    Redis,
    /// In-process store; shares nothing across processes.
    Memory,
    Disabled,
}

impl FromStr for RemoteBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(format!(
                "unknown backend `{other}` (expected redis, memory or disabled)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub backend: RemoteBackend,
    pub url: String,
    pub connect_timeout_ms: NonZeroU32,
    pub command_timeout_ms: NonZeroU32,
    pub slow_command_ms: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub hot_prefixes: Vec<String>,
    pub local_max_entries: NonZeroU32,
    pub local_backfill_ttl_seconds: NonZeroU32,
    pub sweep_interval_seconds: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub slow_query_ms: NonZeroU32,
    pub local_max_entries: NonZeroU32,
    pub statement_timeout_ms: NonZeroU32,
    pub background_write_timeout_ms: NonZeroU32,
    pub sweep_interval_seconds: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ResultsSettings {
    pub aggregate_ttl_seconds: NonZeroU32,
    pub trend_ttl_seconds: NonZeroU32,
    pub trend_windows: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    Settings::from_raw(raw)
}

/// Resolve a single configuration file without touching the environment or CLI.
pub fn load_file(path: &std::path::Path) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from(path).required(true))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    remote: RawRemoteSettings,
    cache: RawCacheSettings,
    query: RawQuerySettings,
    results: RawResultsSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(url) = overrides.remote_url.as_ref() {
            self.remote.url = Some(url.clone());
        }
        if let Some(backend) = overrides.remote_backend.as_ref() {
            self.remote.backend = Some(backend.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            remote,
            cache,
            query,
            results,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            remote: build_remote_settings(remote)?,
            cache: build_cache_settings(cache)?,
            query: build_query_settings(query)?,
            results: build_results_settings(results)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
        "database.max_connections",
    )?;
    let min_connections = database
        .min_connections
        .unwrap_or(DEFAULT_DB_MIN_CONNECTIONS);
    if min_connections > max_connections.get() {
        return Err(LoadError::invalid(
            "database.min_connections",
            "must not exceed database.max_connections",
        ));
    }

    let acquire_timeout_seconds = non_zero_u32(
        database
            .acquire_timeout_seconds
            .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
        "database.acquire_timeout_seconds",
    )?;

    // Zero disables the timeout.
    let idle_timeout_seconds = optional_non_zero_u32(
        database
            .idle_timeout_seconds
            .unwrap_or(DEFAULT_DB_IDLE_TIMEOUT_SECS),
        "database.idle_timeout_seconds",
    )?;
    let max_lifetime_seconds = optional_non_zero_u32(
        database
            .max_lifetime_seconds
            .unwrap_or(DEFAULT_DB_MAX_LIFETIME_SECS),
        "database.max_lifetime_seconds",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
        min_connections,
        acquire_timeout_seconds,
        idle_timeout_seconds,
        max_lifetime_seconds,
    })
}

fn build_remote_settings(remote: RawRemoteSettings) -> Result<RemoteSettings, LoadError> {
    let backend = match remote.backend {
        Some(value) => RemoteBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("remote.backend", reason))?,
        None => RemoteBackend::Redis,
    };

    let url = remote
        .url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_REMOTE_URL.to_string());
    if backend == RemoteBackend::Redis && url.is_empty() {
        return Err(LoadError::invalid(
            "remote.url",
            "must not be empty when the redis backend is selected",
        ));
    }

    Ok(RemoteSettings {
        backend,
        url,
        connect_timeout_ms: non_zero_u32(
            remote
                .connect_timeout_ms
                .unwrap_or(DEFAULT_REMOTE_CONNECT_TIMEOUT_MS),
            "remote.connect_timeout_ms",
        )?,
        command_timeout_ms: non_zero_u32(
            remote
                .command_timeout_ms
                .unwrap_or(DEFAULT_REMOTE_COMMAND_TIMEOUT_MS),
            "remote.command_timeout_ms",
        )?,
        slow_command_ms: non_zero_u32(
            remote
                .slow_command_ms
                .unwrap_or(DEFAULT_REMOTE_SLOW_COMMAND_MS),
            "remote.slow_command_ms",
        )?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let hot_prefixes = match cache.hot_prefixes {
        Some(prefixes) => {
            if prefixes.iter().any(|prefix| prefix.trim().is_empty()) {
                return Err(LoadError::invalid(
                    "cache.hot_prefixes",
                    "prefixes must not be empty",
                ));
            }
            prefixes
        }
        None => DEFAULT_HOT_PREFIXES.iter().map(|p| p.to_string()).collect(),
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        hot_prefixes,
        local_max_entries: non_zero_u32(
            cache.local_max_entries.unwrap_or(DEFAULT_LOCAL_MAX_ENTRIES),
            "cache.local_max_entries",
        )?,
        local_backfill_ttl_seconds: non_zero_u32(
            cache
                .local_backfill_ttl_seconds
                .unwrap_or(DEFAULT_LOCAL_BACKFILL_TTL_SECS),
            "cache.local_backfill_ttl_seconds",
        )?,
        sweep_interval_seconds: non_zero_u32(
            cache
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            "cache.sweep_interval_seconds",
        )?,
    })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    Ok(QuerySettings {
        slow_query_ms: non_zero_u32(
            query.slow_query_ms.unwrap_or(DEFAULT_SLOW_QUERY_MS),
            "query.slow_query_ms",
        )?,
        local_max_entries: non_zero_u32(
            query.local_max_entries.unwrap_or(DEFAULT_LOCAL_MAX_ENTRIES),
            "query.local_max_entries",
        )?,
        statement_timeout_ms: non_zero_u32(
            query
                .statement_timeout_ms
                .unwrap_or(DEFAULT_STATEMENT_TIMEOUT_MS),
            "query.statement_timeout_ms",
        )?,
        background_write_timeout_ms: non_zero_u32(
            query
                .background_write_timeout_ms
                .unwrap_or(DEFAULT_BACKGROUND_WRITE_TIMEOUT_MS),
            "query.background_write_timeout_ms",
        )?,
        sweep_interval_seconds: non_zero_u32(
            query
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            "query.sweep_interval_seconds",
        )?,
    })
}

fn build_results_settings(results: RawResultsSettings) -> Result<ResultsSettings, LoadError> {
    let trend_windows = results
        .trend_windows
        .unwrap_or_else(|| DEFAULT_TREND_WINDOWS.to_vec());
    if trend_windows.contains(&0) {
        return Err(LoadError::invalid(
            "results.trend_windows",
            "windows must be at least one day",
        ));
    }

    Ok(ResultsSettings {
        aggregate_ttl_seconds: non_zero_u32(
            results
                .aggregate_ttl_seconds
                .unwrap_or(DEFAULT_AGGREGATE_TTL_SECS),
            "results.aggregate_ttl_seconds",
        )?,
        trend_ttl_seconds: non_zero_u32(
            results.trend_ttl_seconds.unwrap_or(DEFAULT_TREND_TTL_SECS),
            "results.trend_ttl_seconds",
        )?,
        trend_windows,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u64>,
    min_connections: Option<u32>,
    acquire_timeout_seconds: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    max_lifetime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    backend: Option<String>,
    url: Option<String>,
    connect_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
    slow_command_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    hot_prefixes: Option<Vec<String>>,
    local_max_entries: Option<u64>,
    local_backfill_ttl_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    slow_query_ms: Option<u64>,
    local_max_entries: Option<u64>,
    statement_timeout_ms: Option<u64>,
    background_write_timeout_ms: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResultsSettings {
    aggregate_ttl_seconds: Option<u64>,
    trend_ttl_seconds: Option<u64>,
    trend_windows: Option<Vec<u32>>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn optional_non_zero_u32(value: u64, key: &'static str) -> Result<Option<NonZeroU32>, LoadError> {
    if value == 0 {
        return Ok(None);
    }
    non_zero_u32(value, key).map(Some)
}
