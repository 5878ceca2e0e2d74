//! Persistence boundary for experiments, assignments and events.
//!
//! The service never talks to a database directly; it holds an
//! `Arc<dyn ExperimentStore>` so hosts can plug in PostgreSQL or keep
//! everything in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Assignment, Event, Experiment, ExperimentStatus};

pub mod experiment_repo;
pub mod memory;

pub use experiment_repo::PgExperimentStore;
pub use memory::InMemoryExperimentStore;

pub type StoreResult<T> = Result<T, StoreError>;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Errors raised by store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Experiment not found: {0}")]
    NotFound(Uuid),

    #[error("Experiment {0} was modified concurrently")]
    Stale(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage operations needed by the experiment engine.
///
/// Assignments are written with upsert semantics: when a record for
/// (experiment, subject) already exists it is kept and returned, so
/// concurrent first-touch writers converge on one persisted row.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Insert a new experiment. Fails with `Duplicate` when the name is taken.
    async fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<()>;

    async fn get_experiment(&self, id: Uuid) -> StoreResult<Option<Experiment>>;

    async fn get_experiment_by_name(&self, name: &str) -> StoreResult<Option<Experiment>>;

    /// List experiments, newest first, optionally filtered by status
    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> StoreResult<Vec<Experiment>>;

    /// Replace a stored experiment unless it changed since it was read.
    ///
    /// Fails with `Stale` when the stored `updated_at` differs from
    /// `expected_updated_at`, and with `NotFound` for an unknown id.
    async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_updated_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Insert the assignment unless one exists; returns the persisted record
    async fn upsert_assignment(&self, assignment: &Assignment) -> StoreResult<Assignment>;

    async fn get_assignment(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
    ) -> StoreResult<Option<Assignment>>;

    async fn list_assignments(&self, experiment_id: Uuid) -> StoreResult<Vec<Assignment>>;

    /// Append-only event insert
    async fn append_event(&self, event: &Event) -> StoreResult<()>;

    async fn list_events(&self, experiment_id: Uuid) -> StoreResult<Vec<Event>>;

    /// Delete every assignment and event of an experiment.
    ///
    /// Returns `(assignments_deleted, events_deleted)`.
    async fn reset_experiment(&self, experiment_id: Uuid) -> StoreResult<(u64, u64)>;
}
