//! Courier event-delivery service.
//!
//! Main entry point for the courier daemon. Initializes persistence, the
//! delivery engine, and the monitoring API, and coordinates graceful
//! startup and shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::AppState;
use courier_core::{storage::Storage, MulticastListener, RealClock};
use courier_delivery::{
    DeadLetterService, DeliveryEngine, EngineConfig, FailureClassifier, HandlerRegistry,
    HealthService, HealthThresholds, InMemoryBroker, PostgresEventStore, Publisher, StatsService,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting courier event-delivery service");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %config.server_addr,
        queue = %config.queue,
        max_connections = config.database_max_connections,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let clock = Arc::new(RealClock);
    let storage = Arc::new(Storage::new(db_pool.clone()));
    let store = Arc::new(PostgresEventStore::new(storage));
    let broker = Arc::new(InMemoryBroker::new());

    // Domain handlers are registered here by the embedding application;
    // kinds without a handler are logged and skipped
    let registry = Arc::new(HandlerRegistry::new());

    let mut engine = DeliveryEngine::new(
        store.clone(),
        broker.clone(),
        registry,
        FailureClassifier::new(),
        clock.clone(),
        EngineConfig { queue: config.queue.clone(), ..Default::default() },
    );
    engine.start().await.map_err(|e| anyhow::anyhow!("engine startup failed: {e}"))?;

    let publisher = Arc::new(Publisher::new(
        store.clone(),
        broker,
        Arc::new(MulticastListener::new()),
        clock.clone(),
        config.queue.clone(),
    ));

    let app_state = AppState {
        stats: Arc::new(StatsService::new(store.clone(), clock.clone())),
        health: Arc::new(HealthService::new(store.clone(), clock, config.health_thresholds())),
        dead_letters: Arc::new(DeadLetterService::new(store, publisher)),
    };

    let server_handle = tokio::spawn({
        let addr = config.server_addr;
        async move {
            if let Err(e) = courier_api::start_server(app_state, addr).await {
                error!(error = %e, "monitoring API failed");
            }
        }
    });

    info!(addr = %config.server_addr, "courier is delivering events");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown_graceful().await {
        error!(error = %e, "engine shutdown incomplete");
    }

    server_handle.abort();
    db_pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_records (
            id BIGSERIAL PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            priority TEXT NOT NULL DEFAULT 'normal',
            last_error TEXT,
            last_retry_at TIMESTAMPTZ,
            next_attempt_at TIMESTAMPTZ,
            dead_lettered_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create event_records table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_records_due
        ON event_records(next_attempt_at)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create due-time index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_records_dead_letter
        ON event_records(dead_lettered_at)
        WHERE status = 'dead_letter'
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create dead-letter index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_records_created
        ON event_records(created_at)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create created-at index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections
    database_max_connections: u32,
    /// Monitoring API bind address
    server_addr: SocketAddr,
    /// Queue name events flow through
    queue: String,
    /// Age past which undelivered events count as stale
    health_stale_age_secs: u64,
    /// Stale-event count that trips the health alert
    health_stale_count_max: i64,
    /// Dead-letter count that trips the health alert
    health_dead_letter_max: i64,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SERVER_ADDR format")?;

        let queue = std::env::var("QUEUE_NAME")
            .unwrap_or_else(|_| courier_delivery::DEFAULT_QUEUE.to_string());

        let health_stale_age_secs = std::env::var("HEALTH_STALE_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15 * 60);

        let health_stale_count_max = std::env::var("HEALTH_STALE_COUNT_MAX")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let health_dead_letter_max = std::env::var("HEALTH_DEAD_LETTER_MAX")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        Ok(Self {
            database_url,
            database_max_connections,
            server_addr,
            queue,
            health_stale_age_secs,
            health_stale_count_max,
            health_dead_letter_max,
        })
    }

    fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            stale_age: Duration::from_secs(self.health_stale_age_secs),
            stale_count_max: self.health_stale_count_max,
            dead_letter_max: self.health_dead_letter_max,
        }
    }

    /// Returns database URL with password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        "postgresql://***".to_string()
    }
}
