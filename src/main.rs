use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use strata::{
    application::error::AppError,
    cache::{
        CacheConfig, CacheConsumer, CacheRegistry, CacheTrigger, EventQueue, KeyPattern,
        KvBackend, KvStore, MemoryKv,
    },
    config,
    infra::{
        db::PostgresKv,
        error::InfraError,
        http::{self, CacheState},
        telemetry,
    },
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
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

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Invalidate(args) => run_invalidate(settings, args).await,
        config::Command::PurgeExpired(_) => run_purge_expired(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

/// The configured durable tier, kept concrete so it can be purged.
#[derive(Clone)]
enum KvHandle {
    Memory(Arc<MemoryKv>),
    Postgres(PostgresKv),
}

impl KvHandle {
    fn store(&self) -> Arc<dyn KvStore> {
        match self {
            KvHandle::Memory(kv) => kv.clone(),
            KvHandle::Postgres(kv) => Arc::new(kv.clone()),
        }
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        match self {
            KvHandle::Memory(kv) => Ok(kv.purge_expired() as u64),
            KvHandle::Postgres(kv) => kv.purge_expired().await.map_err(AppError::from),
        }
    }
}

struct CacheRuntime {
    config: CacheConfig,
    kv: Option<KvHandle>,
    registry: Arc<CacheRegistry>,
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer>,
    trigger: Arc<CacheTrigger>,
}

impl CacheRuntime {
    fn state(&self) -> CacheState {
        CacheState {
            config: self.config.clone(),
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            trigger: self.trigger.clone(),
        }
    }
}

async fn connect_postgres(settings: &config::Settings) -> Result<PostgresKv, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresKv::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    PostgresKv::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(PostgresKv::new(pool))
}

async fn init_kv(settings: &config::Settings) -> Result<Option<KvHandle>, AppError> {
    let handle = match settings.cache.kv_backend {
        KvBackend::None => None,
        KvBackend::Memory => Some(KvHandle::Memory(Arc::new(MemoryKv::new()))),
        KvBackend::Postgres => Some(KvHandle::Postgres(connect_postgres(settings).await?)),
    };
    info!(
        target = "strata::cache",
        kv_backend = settings.cache.kv_backend.as_str(),
        "Durable tier ready"
    );
    Ok(handle)
}

async fn build_cache_runtime(settings: &config::Settings) -> Result<CacheRuntime, AppError> {
    let config = settings.cache_config();
    let kv = init_kv(settings).await?;

    let registry = Arc::new(CacheRegistry::from_config(
        &config,
        kv.as_ref().map(KvHandle::store),
    ));
    let queue = Arc::new(EventQueue::new(
        config.event_queue_limit_non_zero(),
        config.event_log_limit,
    ));
    let consumer = Arc::new(CacheConsumer::new(
        config.clone(),
        registry.clone(),
        queue.clone(),
    ));
    let trigger = Arc::new(CacheTrigger::new(
        config.clone(),
        queue.clone(),
        consumer.clone(),
    ));

    Ok(CacheRuntime {
        config,
        kv,
        registry,
        queue,
        consumer,
        trigger,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runtime = build_cache_runtime(&settings).await?;

    let consume_handle = runtime.config.is_enabled().then(|| {
        spawn_auto_consume(
            runtime.consumer.clone(),
            settings.cache.auto_consume_interval,
        )
    });
    let purge_handle = runtime
        .kv
        .clone()
        .map(|kv| spawn_kv_purge(kv, settings.cache.kv_purge_interval));

    let result = serve_http(&settings, runtime.state()).await;

    for handle in [consume_handle, purge_handle].into_iter().flatten() {
        handle.abort();
        let _ = handle.await;
    }

    result
}

fn spawn_auto_consume(consumer: Arc<CacheConsumer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            consumer.consume().await;
        }
    })
}

fn spawn_kv_purge(kv: KvHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match kv.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(target = "strata::cache", purged, "Expired KV entries purged"),
                Err(err) => warn!(target = "strata::cache", error = %err, "KV purge failed"),
            }
        }
    })
}

async fn run_invalidate(
    settings: config::Settings,
    args: config::InvalidateArgs,
) -> Result<(), AppError> {
    let pattern = KeyPattern::new(args.pattern.trim())?;
    let runtime = build_cache_runtime(&settings).await?;

    if runtime.kv.is_none() {
        return Err(AppError::validation(
            "invalidate needs a durable tier; set cache.kv_backend",
        ));
    }

    let namespace = args.namespace.as_deref();
    if let Some(namespace) = namespace
        && !runtime.registry.profiles().contains(namespace)
    {
        return Err(AppError::validation(format!(
            "unknown cache namespace `{namespace}`"
        )));
    }

    let removed = runtime.registry.invalidate(namespace, &pattern).await;
    info!(
        target = "strata::invalidate",
        pattern = %pattern,
        namespace = namespace.unwrap_or("*"),
        removed,
        "Invalidation completed"
    );
    Ok(())
}

async fn run_purge_expired(settings: config::Settings) -> Result<(), AppError> {
    let kv = connect_postgres(&settings).await?;
    let purged = kv.purge_expired().await?;
    info!(target = "strata::purge", purged, "Expired KV entries purged");
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    connect_postgres(&settings).await?;
    info!(target = "strata::migrate", "Migrations applied");
    Ok(())
}

async fn serve_http(settings: &config::Settings, state: CacheState) -> Result<(), AppError> {
    let router = http::build_cache_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "strata::http",
        addr = %settings.server.addr,
        "Cache admin API listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        wait_for_shutdown(shutdown_rx).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = deadline => {
            warn!(
                target = "strata::http",
                grace_secs = grace.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
        }
    }

    info!(target = "strata::http", "Server stopped");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone without a signal: never shut down from here.
            std::future::pending::<()>().await;
        }
    }
}
