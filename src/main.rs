use ciel_topup::api::{self, AppState};
use ciel_topup::cache::{init_cache_pool, CachePoolConfig, RedisIdempotencyStore};
use ciel_topup::config::AppConfig;
use ciel_topup::database::fulfillment_repository::PgFulfillmentAttemptRepository;
use ciel_topup::database::init_pool_from_config;
use ciel_topup::database::order_repository::PgOrderRepository;
use ciel_topup::database::payment_session_repository::PgPaymentSessionRepository;
use ciel_topup::database::webhook_repository::PgWebhookEventRepository;
use ciel_topup::engine::{Engine, EngineConfig, EngineDeps};
use ciel_topup::health::{DatabaseProbe, HealthChecker, HealthProbe, IdempotencyProbe};
use ciel_topup::logging::init_tracing;
use ciel_topup::payments::factory::PaymentProviderFactory;
use ciel_topup::services::catalog::Catalog;
use ciel_topup::workers::fulfillment::PublisherRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        "Starting top-up backend"
    );

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::from_path(path)?,
        None => Catalog::default(),
    };

    let provider = PaymentProviderFactory::from_config(&config.payment)?;
    let publishers = PublisherRegistry::from_config(&config.publisher)?;
    for publisher in catalog.publishers() {
        if publishers.resolve(&publisher).is_none() {
            warn!(publisher = %publisher, "no client configured, its orders will be refunded");
        }
    }
    info!(
        provider = %provider.name(),
        publishers = catalog.publishers().len(),
        "integrations configured"
    );

    let (deps, probes) = match (&config.database, &config.cache) {
        (Some(db_config), Some(cache_config)) if !config.skip_externals => {
            info!("Initializing database connection pool...");
            let pool = init_pool_from_config(db_config).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;

            info!("Initializing Redis connection pool...");
            let redis = init_cache_pool(CachePoolConfig::from(cache_config))
                .await
                .map_err(|e| {
                    error!("Failed to initialize cache pool: {}", e);
                    e
                })?;
            let idempotency = Arc::new(RedisIdempotencyStore::new(redis));

            let probes: Vec<Arc<dyn HealthProbe>> = vec![
                Arc::new(DatabaseProbe::new(pool.clone())),
                Arc::new(IdempotencyProbe::new(idempotency.clone())),
            ];
            let deps = EngineDeps {
                orders: Arc::new(PgOrderRepository::new(pool.clone())),
                sessions: Arc::new(PgPaymentSessionRepository::new(pool.clone())),
                webhook_events: Arc::new(PgWebhookEventRepository::new(pool.clone())),
                attempts: Arc::new(PgFulfillmentAttemptRepository::new(pool)),
                idempotency,
                provider,
                publishers,
                catalog,
            };
            (deps, probes)
        }
        _ => {
            info!("Using in-memory stores (SKIP_EXTERNALS=true)");
            let mut deps = EngineDeps::in_memory(provider, publishers);
            deps.catalog = catalog;
            let probes: Vec<Arc<dyn HealthProbe>> =
                vec![Arc::new(IdempotencyProbe::new(deps.idempotency.clone()))];
            (deps, probes)
        }
    };

    let (engine, receiver) = Engine::new(deps, EngineConfig::from_app_config(&config));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let worker_handles = engine.spawn_workers(receiver, worker_shutdown_rx);

    let app = api::router(AppState {
        engine,
        health: HealthChecker::new(probes),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    for handle in worker_handles {
        if tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .is_err()
        {
            error!("Timed out waiting for worker shutdown");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
