// ForecastCheck pipeline v0.1
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod collectors;
mod config;
mod db;
mod errors;
mod helpers;
mod scheduler;
mod services;

use collectors::arome::AromeCollector;
use collectors::ffvl::FfvlCollector;
use collectors::meteo_parapente::MeteoParapenteCollector;
use collectors::romma::RommaCollector;
use config::{AppConfig, Environment};
use scheduler::jobs::{JobContext, FORECAST_JOB_ID, OBSERVATION_JOB_ID, RECONCILE_JOB_ID};
use scheduler::scheduler::CollectionScheduler;

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 20;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() {
    let app_config = AppConfig::from_env();

    // Initialize tracing; production gets JSON lines, development pretty fmt
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "forecastcheck=debug,sqlx=warn".into());
    match app_config.environment {
        Environment::Production => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        Environment::Development => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&app_config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations completed");

    // Construct collectors (rate limiters and circuit breakers live inside,
    // one per source for the whole process)
    let ctx = JobContext {
        pool: pool.clone(),
        arome: Arc::new(
            AromeCollector::new(app_config.meteofrance_api_token.as_deref())
                .expect("Failed to build AROME collector"),
        ),
        meteo_parapente: Arc::new(
            MeteoParapenteCollector::new().expect("Failed to build Meteo-Parapente collector"),
        ),
        romma: Arc::new(RommaCollector::new().expect("Failed to build ROMMA collector")),
        ffvl: Arc::new(FfvlCollector::new().expect("Failed to build FFVL collector")),
    };

    // Surface where each job left off across restarts
    for job_id in [FORECAST_JOB_ID, OBSERVATION_JOB_ID, RECONCILE_JOB_ID] {
        match db::queries::execution_history(&pool, job_id, 1).await {
            Ok(history) => match history.first() {
                Some(last) => tracing::info!(
                    "Last {} run: {} at {} ({} collected, {} persisted)",
                    job_id,
                    last.status,
                    last.start_time,
                    last.records_collected,
                    last.records_persisted,
                ),
                None => tracing::info!("No previous {} runs recorded", job_id),
            },
            Err(e) => tracing::warn!("Failed to read execution history for {}: {}", job_id, e),
        }
    }

    let mut collection_scheduler = None;
    if app_config.scheduler_enabled {
        let mut sched = CollectionScheduler::new(
            ctx,
            &app_config.forecast_hours,
            &app_config.observation_hours,
            &app_config.reconcile_hours,
        )
        .await
        .expect("Failed to build scheduler");
        sched.start().await.expect("Failed to start scheduler");
        collection_scheduler = Some(sched);
    } else {
        tracing::info!("Scheduler is disabled via configuration");
    }

    // Run until the process is told to stop
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received");

    if let Some(mut sched) = collection_scheduler {
        if let Err(e) = sched.shutdown().await {
            tracing::error!("Scheduler shutdown failed: {}", e);
        }
    }

    pool.close().await;
    tracing::info!("Shutdown complete");
}
