use std::sync::Arc;

use experiment_service::{
    cache::{AssignmentCache, InMemoryAssignmentCache, RedisAssignmentCache},
    db::{self, ExperimentStore, InMemoryExperimentStore, PgExperimentStore},
    jobs::run_results_snapshot_loop,
    Config, ExperimentService,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    let json_logs = config.app.log_format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(json_logs.then(|| fmt::layer().json()))
        .with((!json_logs).then(fmt::layer))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        service = %config.app.service_name,
        env = %config.app.env,
        "Starting experiment service"
    );

    let store: Arc<dyn ExperimentStore> = match &config.database {
        Some(database) => {
            let pool = db::create_pool(&database.url, database.max_connections).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations completed");
            Arc::new(PgExperimentStore::new(pool))
        }
        None => {
            if config.is_production() {
                anyhow::bail!("DATABASE_URL must be set in production");
            }
            warn!("DATABASE_URL not set - using in-memory store, data is lost on restart");
            Arc::new(InMemoryExperimentStore::new())
        }
    };

    let cache: Arc<dyn AssignmentCache> = match &config.redis {
        Some(redis) => Arc::new(
            RedisAssignmentCache::connect(&redis.url, redis.assignment_ttl_secs).await?,
        ),
        None => {
            info!("REDIS_URL not set - using in-process assignment cache");
            Arc::new(InMemoryAssignmentCache::new())
        }
    };

    let service = ExperimentService::new(store, cache).with_defaults(
        config.experiments.default_confidence_level,
        config.experiments.default_goal_event.clone(),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let snapshot_handle = tokio::spawn(run_results_snapshot_loop(
        service.clone(),
        config.experiments.results_refresh_interval_secs,
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if shutdown_tx.send(()).is_err() {
        warn!("Results snapshot job already stopped");
    }
    if let Err(e) = snapshot_handle.await {
        error!(error = %e, "Results snapshot task panicked");
    }

    info!("Experiment service stopped");
    Ok(())
}
