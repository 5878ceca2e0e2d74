/// Experiment repository - PostgreSQL implementation of `ExperimentStore`
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{ExperimentStore, StoreError, StoreResult};
use crate::models::{
    Assignment, Event, EventType, Experiment, ExperimentStatus, TargetingRules, Variant,
};

const EXPERIMENT_COLUMNS: &str = r#"
    id, name, description, variants, allocation, targeting, status, start_date, end_date,
    sample_size, confidence_level, goal_event, epoch, created_at, updated_at, created_by
"#;

/// PostgreSQL error code for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgExperimentStore {
    pool: PgPool,
}

impl PgExperimentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExperimentRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    variants: Json<Vec<Variant>>,
    allocation: Json<BTreeMap<String, u32>>,
    targeting: Option<Json<TargetingRules>>,
    status: ExperimentStatus,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    sample_size: Option<i64>,
    confidence_level: Option<f64>,
    goal_event: Option<String>,
    epoch: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: Option<Uuid>,
}

impl From<ExperimentRow> for Experiment {
    fn from(row: ExperimentRow) -> Self {
        Experiment {
            id: row.id,
            name: row.name,
            description: row.description,
            variants: row.variants.0,
            allocation: row.allocation.0,
            targeting: row.targeting.map(|t| t.0),
            status: row.status,
            start_date: row.start_date,
            end_date: row.end_date,
            sample_size: row.sample_size,
            confidence_level: row.confidence_level,
            goal_event: row.goal_event,
            epoch: row.epoch,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    experiment_id: Uuid,
    variant_id: String,
    subject_id: String,
    event_type: String,
    payload: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            experiment_id: row.experiment_id,
            variant_id: row.variant_id,
            subject_id: row.subject_id,
            event_type: EventType::from(row.event_type),
            payload: row.payload,
            recorded_at: row.recorded_at,
        }
    }
}

fn map_unique_violation(err: sqlx::Error, key: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Duplicate(key.to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl ExperimentStore for PgExperimentStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO experiments
                (id, name, description, variants, allocation, targeting, status, start_date,
                 end_date, sample_size, confidence_level, goal_event, epoch, created_at,
                 updated_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(experiment.id)
        .bind(&experiment.name)
        .bind(&experiment.description)
        .bind(Json(&experiment.variants))
        .bind(Json(&experiment.allocation))
        .bind(experiment.targeting.as_ref().map(Json))
        .bind(experiment.status)
        .bind(experiment.start_date)
        .bind(experiment.end_date)
        .bind(experiment.sample_size)
        .bind(experiment.confidence_level)
        .bind(&experiment.goal_event)
        .bind(experiment.epoch)
        .bind(experiment.created_at)
        .bind(experiment.updated_at)
        .bind(experiment.created_by)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &experiment.name))?;

        Ok(())
    }

    async fn get_experiment(&self, id: Uuid) -> StoreResult<Option<Experiment>> {
        let row = sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {} FROM experiments WHERE id = $1",
            EXPERIMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Experiment::from))
    }

    async fn get_experiment_by_name(&self, name: &str) -> StoreResult<Option<Experiment>> {
        let row = sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {} FROM experiments WHERE name = $1",
            EXPERIMENT_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Experiment::from))
    }

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> StoreResult<Vec<Experiment>> {
        let rows = sqlx::query_as::<_, ExperimentRow>(&format!(
            r#"
            SELECT {}
            FROM experiments
            WHERE $1::experiment_status IS NULL OR status = $1
            ORDER BY created_at DESC
            "#,
            EXPERIMENT_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Experiment::from).collect())
    }

    async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE experiments
            SET name = $2,
                description = $3,
                variants = $4,
                allocation = $5,
                targeting = $6,
                status = $7,
                start_date = $8,
                end_date = $9,
                sample_size = $10,
                confidence_level = $11,
                goal_event = $12,
                epoch = $13,
                updated_at = $14
            WHERE id = $1 AND updated_at = $15
            "#,
        )
        .bind(experiment.id)
        .bind(&experiment.name)
        .bind(&experiment.description)
        .bind(Json(&experiment.variants))
        .bind(Json(&experiment.allocation))
        .bind(experiment.targeting.as_ref().map(Json))
        .bind(experiment.status)
        .bind(experiment.start_date)
        .bind(experiment.end_date)
        .bind(experiment.sample_size)
        .bind(experiment.confidence_level)
        .bind(&experiment.goal_event)
        .bind(experiment.epoch)
        .bind(experiment.updated_at)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &experiment.name))?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM experiments WHERE id = $1)")
                    .bind(experiment.id)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists {
                StoreError::Stale(experiment.id)
            } else {
                StoreError::NotFound(experiment.id)
            });
        }

        Ok(())
    }

    async fn upsert_assignment(&self, assignment: &Assignment) -> StoreResult<Assignment> {
        // The no-op DO UPDATE keeps the first writer's variant and still returns the row
        let persisted = sqlx::query_as::<_, Assignment>(
            r#"
            INSERT INTO experiment_assignments (experiment_id, subject_id, variant_id, epoch, assigned_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (experiment_id, subject_id) DO UPDATE
            SET variant_id = experiment_assignments.variant_id
            RETURNING experiment_id, subject_id, variant_id, epoch, assigned_at
            "#,
        )
        .bind(assignment.experiment_id)
        .bind(&assignment.subject_id)
        .bind(&assignment.variant_id)
        .bind(assignment.epoch)
        .bind(assignment.assigned_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(persisted)
    }

    async fn get_assignment(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
    ) -> StoreResult<Option<Assignment>> {
        let assignment = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT experiment_id, subject_id, variant_id, epoch, assigned_at
            FROM experiment_assignments
            WHERE experiment_id = $1 AND subject_id = $2
            "#,
        )
        .bind(experiment_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(assignment)
    }

    async fn list_assignments(&self, experiment_id: Uuid) -> StoreResult<Vec<Assignment>> {
        let assignments = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT experiment_id, subject_id, variant_id, epoch, assigned_at
            FROM experiment_assignments
            WHERE experiment_id = $1
            ORDER BY assigned_at
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(assignments)
    }

    async fn append_event(&self, event: &Event) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO experiment_events
                (id, experiment_id, variant_id, subject_id, event_type, payload, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.experiment_id)
        .bind(&event.variant_id)
        .bind(&event.subject_id)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(&self, experiment_id: Uuid) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, experiment_id, variant_id, subject_id, event_type, payload, recorded_at
            FROM experiment_events
            WHERE experiment_id = $1
            ORDER BY recorded_at
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn reset_experiment(&self, experiment_id: Uuid) -> StoreResult<(u64, u64)> {
        let mut tx = self.pool.begin().await?;

        let events = sqlx::query("DELETE FROM experiment_events WHERE experiment_id = $1")
            .bind(experiment_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let assignments =
            sqlx::query("DELETE FROM experiment_assignments WHERE experiment_id = $1")
                .bind(experiment_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;

        Ok((assignments, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_row_maps_known_and_custom_types() {
        let base = EventRow {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            variant_id: "control".to_string(),
            subject_id: "guest-42".to_string(),
            event_type: "conversion".to_string(),
            payload: serde_json::json!({"booking_id": 7}),
            recorded_at: Utc::now(),
        };
        let event = Event::from(base);
        assert_eq!(event.event_type, EventType::Conversion);

        let custom = EventRow {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            variant_id: "new".to_string(),
            subject_id: "guest-43".to_string(),
            event_type: "search".to_string(),
            payload: serde_json::Value::Null,
            recorded_at: Utc::now(),
        };
        assert_eq!(
            Event::from(custom).event_type,
            EventType::Custom("search".to_string())
        );
    }
}
