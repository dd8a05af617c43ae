//! relaymq outbox delivery service.
//!
//! Main entry point for the relaymq server. Bootstraps the queue schema,
//! freezes the consumer registry, runs the delivery engine, and coordinates
//! graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relaymq_core::{
    storage::{schema, Storage},
    Clock, RealClock, RequestContext,
};
use relaymq_delivery::{ConsumerRegistry, DeliveryEngine, Provider};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

mod config;
mod demo;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing with structured logging
    init_tracing(&config.rust_log)?;

    info!("Starting relaymq outbox delivery service");
    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        max_attempts = config.max_attempts,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::migrate(&db_pool).await.context("Failed to bootstrap queue schema")?;
    demo::migrate(&db_pool).await?;
    info!("Database schema ready");

    let mut builder = ConsumerRegistry::builder();
    demo::register(&mut builder)?;
    let registry = Arc::new(builder.build());
    info!(consumers = ?registry.names(), "Consumer registry frozen");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    if config.seed_demo_order {
        let provider = Provider::new(
            registry.clone(),
            storage.clone(),
            clock.clone(),
            config.provider_config(),
        );
        let ctx = RequestContext::new().with_request_id("startup-seed");
        let order_id = demo::place_order(&db_pool, &provider, "demo widget", &ctx).await?;
        info!(order_id, "Seeded demo order");
    }

    let mut engine =
        DeliveryEngine::with_clock(storage, registry, config.delivery_config(), clock)?;
    engine.start().await;

    info!("relaymq is delivering queued messages");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Delivery engine did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("relaymq shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                Storage::new(pool.clone())
                    .health_check()
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
