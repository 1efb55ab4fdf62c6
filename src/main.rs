use std::{process, sync::Arc};

use strata::{
    application::{
        error::AppError,
        result_cache::{ResultCache, ResultCacheConfig},
    },
    cache::{CacheConfig, CacheService, MemoryStore, RemoteStore, Sweeper},
    config::{self, RemoteBackend},
    infra::{
        db::{Database, PgQueryBackend, PoolConfig},
        error::InfraError,
        redis_store::{RedisConfig, RedisStore},
        telemetry,
    },
    query::{QueryConfig, QueryOptimizer},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        let code = error.exit_code();
        report_application_error(&error);
        process::exit(code);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args.command.unwrap_or(config::Command::Serve);

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve => run_serve(settings).await,
        config::Command::Health => run_health(settings).await,
        config::Command::Info => run_info(settings).await,
        config::Command::Flush(args) => run_flush(settings, args).await,
        config::Command::Warmup(args) => run_warmup(settings, args).await,
        config::Command::Invalidate(args) => run_invalidate(settings, args).await,
    }
}

/// Connect the configured remote tier; an unreachable Redis leaves the tier disabled.
async fn connect_remote(settings: &config::RemoteSettings) -> Option<Arc<dyn RemoteStore>> {
    match settings.backend {
        RemoteBackend::Disabled => {
            info!(target: "strata::startup", "remote tier disabled by configuration");
            None
        }
        RemoteBackend::Memory => {
            info!(target: "strata::startup", "using in-process remote store");
            Some(Arc::new(MemoryStore::new()))
        }
        RemoteBackend::Redis => match RedisStore::connect(&RedisConfig::from(settings)).await {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(
                    target: "strata::startup",
                    error = %err,
                    "remote store unreachable; running with the remote tier disabled"
                );
                None
            }
        },
    }
}

async fn build_cache(settings: &config::Settings) -> Arc<CacheService> {
    let remote = connect_remote(&settings.remote).await;
    Arc::new(CacheService::with_remote(
        remote,
        CacheConfig::from(&settings.cache),
    ))
}

async fn connect_database(settings: &config::DatabaseSettings) -> Result<Database, AppError> {
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;
    Ok(Database::connect(url, PoolConfig::from(settings)).await?)
}

fn result_cache(settings: &config::Settings, cache: Arc<CacheService>) -> ResultCache {
    ResultCache::new(cache, ResultCacheConfig::from(&settings.results))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings).await;
    let database = connect_database(&settings.database).await?;
    database.health_check().await?;

    let backend = Arc::new(PgQueryBackend::new(database.pool().clone()));
    let optimizer = Arc::new(QueryOptimizer::new(
        backend,
        cache.clone(),
        QueryConfig::from(&settings.query),
    ));

    let sweepers = [
        Sweeper::spawn("cache", cache.config().sweep_interval(), cache.clone()),
        Sweeper::spawn(
            "query-results",
            optimizer.config().sweep_interval(),
            optimizer.clone(),
        ),
    ];

    info!(
        target: "strata::serve",
        remote = cache.is_available(),
        "services ready; waiting for shutdown signal"
    );

    let signal = tokio::signal::ctrl_c().await;

    for sweeper in sweepers {
        sweeper.stop().await;
    }

    signal.map_err(InfraError::Io)?;
    info!(
        target: "strata::serve",
        prepared_statements = optimizer.stats().prepared_statements,
        "shutdown complete"
    );
    Ok(())
}

async fn run_health(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings).await;
    cache.ping().await?;
    info!(target: "strata::health", "remote store reachable");

    if settings.database.url.is_none() {
        warn!(target: "strata::health", "database url not configured; skipping database check");
        return Ok(());
    }

    let database = connect_database(&settings.database).await?;
    let stats = database.health_check().await?;
    info!(
        target: "strata::health",
        open = stats.open_connections,
        idle = stats.idle_connections,
        max = stats.max_connections,
        "database reachable"
    );
    Ok(())
}

async fn run_info(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings).await;
    let keys = cache.db_size().await?;
    let hit_rate = cache.hit_rate().await?;
    let mut info: Vec<_> = cache.info().await?.into_iter().collect();
    info.sort();

    println!("keys\t{keys}");
    println!("hit_rate\t{hit_rate:.4}");
    for (field, value) in info {
        println!("{field}\t{value}");
    }
    Ok(())
}

async fn run_flush(settings: config::Settings, args: config::FlushArgs) -> Result<(), AppError> {
    if !args.yes {
        return Err(AppError::validation(
            "flush removes every remote key; re-run with --yes to confirm",
        ));
    }

    let cache = build_cache(&settings).await;
    cache.flush_db().await?;
    info!(target: "strata::flush", "remote store flushed");
    Ok(())
}

async fn run_warmup(settings: config::Settings, args: config::WarmupArgs) -> Result<(), AppError> {
    let cache = build_cache(&settings).await;
    let report = result_cache(&settings, cache).warmup(args.subject).await?;

    info!(
        target: "strata::warmup",
        subject_id = args.subject,
        checked = report.checked,
        missing = report.missing.len(),
        "warmup check finished"
    );
    for key in &report.missing {
        println!("{key}");
    }
    Ok(())
}

async fn run_invalidate(
    settings: config::Settings,
    args: config::InvalidateArgs,
) -> Result<(), AppError> {
    let cache = build_cache(&settings).await;

    let removed = match (args.subject, args.pattern) {
        (Some(subject), _) => {
            result_cache(&settings, cache)
                .invalidate_subject(subject)
                .await?
        }
        (None, Some(pattern)) => cache.delete_pattern(&pattern).await?,
        (None, None) => {
            return Err(AppError::validation(
                "invalidate requires --subject or --pattern",
            ));
        }
    };

    println!("{removed}");
    Ok(())
}
