/// Experiment Service - definitions, lifecycle, assignment, events and results
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::assignment::{AssignmentEngine, AssignmentResponse};
use super::events::{EventInput, EventRecorder, RecordOutcome};
use super::lifecycle::apply_transition;
use super::statistics::{compute_results, ExperimentResults};
use crate::cache::AssignmentCache;
use crate::db::{ExperimentStore, StoreError};
use crate::error::{ExperimentError, Result};
use crate::metrics::RESULTS_DURATION_SECONDS;
use crate::models::{
    CreateExperimentRequest, EventType, Experiment, ExperimentStatus, SubjectAttributes,
    UpdateExperimentRequest, DEFAULT_GOAL_EVENT,
};

pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
const MAX_NAME_LEN: usize = 255;
const MAX_UPDATE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct ExperimentService {
    store: Arc<dyn ExperimentStore>,
    engine: AssignmentEngine,
    recorder: EventRecorder,
    default_confidence_level: f64,
    default_goal_event: String,
}

impl ExperimentService {
    pub fn new(store: Arc<dyn ExperimentStore>, cache: Arc<dyn AssignmentCache>) -> Self {
        let engine = AssignmentEngine::new(store.clone(), cache);
        let recorder = EventRecorder::new(store.clone(), engine.clone());
        Self {
            store,
            engine,
            recorder,
            default_confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            default_goal_event: DEFAULT_GOAL_EVENT.to_string(),
        }
    }

    /// Override the confidence level and goal event used when an experiment names none
    pub fn with_defaults(mut self, confidence_level: f64, goal_event: impl Into<String>) -> Self {
        self.default_confidence_level = confidence_level;
        self.default_goal_event = goal_event.into();
        self
    }

    // ======================
    // Definitions
    // ======================

    /// Create a new experiment in `draft`
    pub async fn create_experiment(&self, req: CreateExperimentRequest) -> Result<Experiment> {
        req.validate()?;

        let now = Utc::now();
        let experiment = Experiment {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            description: req.description,
            variants: req.variants,
            allocation: req.allocation,
            targeting: req.targeting,
            status: ExperimentStatus::Draft,
            start_date: req.start_date,
            end_date: req.end_date,
            sample_size: req.sample_size,
            confidence_level: req.confidence_level,
            goal_event: req.goal_event,
            epoch: 0,
            created_at: now,
            updated_at: now,
            created_by: req.created_by,
        };
        validate_definition(&experiment)?;

        if self
            .store
            .get_experiment_by_name(&experiment.name)
            .await?
            .is_some()
        {
            return Err(ExperimentError::Conflict(format!(
                "experiment name already exists: {}",
                experiment.name
            )));
        }

        self.store.insert_experiment(&experiment).await?;
        info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            variants = experiment.variants.len(),
            "Created experiment"
        );

        Ok(experiment)
    }

    pub async fn get_experiment(&self, id: Uuid) -> Result<Experiment> {
        self.store
            .get_experiment(id)
            .await?
            .ok_or(ExperimentError::NotFound(id))
    }

    pub async fn get_experiment_by_name(&self, name: &str) -> Result<Experiment> {
        self.store
            .get_experiment_by_name(name)
            .await?
            .ok_or_else(|| ExperimentError::NotFoundByName(name.to_string()))
    }

    /// Newest first, optionally filtered by status
    pub async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>> {
        Ok(self.store.list_experiments(status).await?)
    }

    /// Apply a partial update, then an optional status transition.
    ///
    /// Field edits are only accepted while the experiment is in `draft` or
    /// `paused`. Nothing is persisted unless the whole patch succeeds. A
    /// write that races another update is re-applied to the fresh state.
    pub async fn update_experiment(
        &self,
        id: Uuid,
        req: UpdateExperimentRequest,
    ) -> Result<Experiment> {
        let mut attempt = 1;
        loop {
            let current = self.get_experiment(id).await?;
            let previous_status = current.status;
            let expected_updated_at = current.updated_at;
            let experiment = apply_update(current, &req, Utc::now())?;

            match self
                .store
                .update_experiment(&experiment, expected_updated_at)
                .await
            {
                Ok(()) => {
                    if experiment.status != previous_status {
                        info!(
                            experiment_id = %experiment.id,
                            from = %previous_status,
                            to = %experiment.status,
                            "Experiment status changed"
                        );
                    } else {
                        info!(
                            experiment_id = %experiment.id,
                            epoch = experiment.epoch,
                            "Updated experiment"
                        );
                    }
                    return Ok(experiment);
                }
                Err(StoreError::Stale(_)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(
                        experiment_id = %id,
                        attempt,
                        "Experiment changed during update, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// draft -> active
    pub async fn start_experiment(&self, id: Uuid) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Active, ExperimentStatus::Draft)
            .await
    }

    /// active -> paused
    pub async fn pause_experiment(&self, id: Uuid) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Paused, ExperimentStatus::Active)
            .await
    }

    /// paused -> active
    pub async fn resume_experiment(&self, id: Uuid) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Active, ExperimentStatus::Paused)
            .await
    }

    /// draft | active | paused -> completed
    pub async fn complete_experiment(&self, id: Uuid) -> Result<Experiment> {
        self.update_experiment(
            id,
            UpdateExperimentRequest {
                status: Some(ExperimentStatus::Completed),
                ..Default::default()
            },
        )
        .await
    }

    /// `expected_from` keeps start/resume distinct: starting a paused
    /// experiment is reported as an invalid transition.
    async fn transition(
        &self,
        id: Uuid,
        to: ExperimentStatus,
        expected_from: ExperimentStatus,
    ) -> Result<Experiment> {
        let experiment = self.get_experiment(id).await?;
        if experiment.status != expected_from {
            return Err(ExperimentError::InvalidTransition {
                from: experiment.status,
                to,
            });
        }

        self.update_experiment(
            id,
            UpdateExperimentRequest {
                status: Some(to),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete every assignment and event of an experiment.
    ///
    /// Refused for active experiments (pause first) and completed ones.
    pub async fn reset_experiment(&self, id: Uuid) -> Result<(u64, u64)> {
        let experiment = self.get_experiment(id).await?;
        match experiment.status {
            ExperimentStatus::Active => {
                return Err(ExperimentError::validation(
                    "pause the experiment before resetting it",
                ))
            }
            ExperimentStatus::Completed => {
                return Err(ExperimentError::validation(
                    "completed experiments are immutable",
                ))
            }
            ExperimentStatus::Draft | ExperimentStatus::Paused => {}
        }

        let (assignments, events) = self.store.reset_experiment(id).await?;
        self.engine.invalidate(id).await;

        warn!(
            experiment_id = %id,
            assignments,
            events,
            "Reset experiment data"
        );
        Ok((assignments, events))
    }

    // ======================
    // Assignment
    // ======================

    /// Variant for a subject, assigning on first eligible call.
    ///
    /// `Ok(None)` means the subject is not enrolled.
    pub async fn assign(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
        attributes: &SubjectAttributes,
    ) -> Result<Option<AssignmentResponse>> {
        let experiment = self.get_experiment(experiment_id).await?;
        let Some(assignment) = self
            .engine
            .assign(&experiment, subject_id, attributes, Utc::now())
            .await?
        else {
            return Ok(None);
        };

        let variant_id = assignment.variant_id.clone();
        let response = AssignmentResponse::build(&experiment, assignment);
        if response.is_none() {
            warn!(
                experiment_id = %experiment_id,
                subject_id,
                variant_id = %variant_id,
                "Assignment references an unknown variant"
            );
        }
        Ok(response)
    }

    /// Infallible variant lookup for hosts that fall back to a default experience
    pub async fn variant_for(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
        attributes: &SubjectAttributes,
    ) -> Option<String> {
        match self.assign(experiment_id, subject_id, attributes).await {
            Ok(response) => response.map(|r| r.variant_id),
            Err(e) => {
                warn!(
                    experiment_id = %experiment_id,
                    subject_id,
                    error = %e,
                    "Variant lookup failed, serving default"
                );
                None
            }
        }
    }

    // ======================
    // Events
    // ======================

    pub async fn record_event(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<RecordOutcome> {
        let experiment = self.get_experiment(experiment_id).await?;
        self.recorder
            .record(&experiment, subject_id, event_type, payload, Utc::now())
            .await
    }

    pub async fn record_batch(
        &self,
        experiment_id: Uuid,
        events: Vec<EventInput>,
    ) -> Result<Vec<RecordOutcome>> {
        let experiment = self.get_experiment(experiment_id).await?;
        self.recorder
            .record_batch(&experiment, events, Utc::now())
            .await
    }

    // ======================
    // Results
    // ======================

    pub async fn get_results(&self, experiment_id: Uuid) -> Result<ExperimentResults> {
        let experiment = self.get_experiment(experiment_id).await?;
        let assignments = self.store.list_assignments(experiment_id).await?;
        let events = self.store.list_events(experiment_id).await?;

        let timer = RESULTS_DURATION_SECONDS.start_timer();
        let results = compute_results(
            &experiment,
            &assignments,
            &events,
            &self.default_goal_event,
            self.default_confidence_level,
        );
        timer.observe_duration();

        Ok(results)
    }
}

/// Patch `experiment` in memory; the caller persists the result
fn apply_update(
    mut experiment: Experiment,
    req: &UpdateExperimentRequest,
    now: DateTime<Utc>,
) -> Result<Experiment> {
    if req.has_field_changes() {
        match experiment.status {
            ExperimentStatus::Active => {
                return Err(ExperimentError::validation(
                    "pause the experiment before editing it",
                ))
            }
            ExperimentStatus::Completed => {
                return Err(ExperimentError::validation(
                    "completed experiments are immutable",
                ))
            }
            ExperimentStatus::Draft | ExperimentStatus::Paused => {}
        }

        if experiment.status == ExperimentStatus::Paused {
            if let Some(variants) = &req.variants {
                let kept: HashSet<&str> = variants.iter().map(|v| v.id.as_str()).collect();
                if let Some(removed) = experiment
                    .variants
                    .iter()
                    .find(|v| !kept.contains(v.id.as_str()))
                {
                    return Err(ExperimentError::validation(format!(
                        "variant '{}' has assignments and cannot be removed while paused",
                        removed.id
                    )));
                }
            }
        }

        let mut bump_epoch = false;
        if let Some(name) = &req.name {
            experiment.name = name.trim().to_string();
        }
        if let Some(description) = &req.description {
            experiment.description = description.clone();
        }
        if let Some(variants) = &req.variants {
            experiment.variants = variants.clone();
        }
        if let Some(allocation) = &req.allocation {
            bump_epoch |= *allocation != experiment.allocation;
            experiment.allocation = allocation.clone();
        }
        if let Some(targeting) = &req.targeting {
            bump_epoch |= *targeting != experiment.targeting;
            experiment.targeting = targeting.clone();
        }
        if let Some(start_date) = req.start_date {
            experiment.start_date = start_date;
        }
        if let Some(end_date) = req.end_date {
            experiment.end_date = end_date;
        }
        if let Some(sample_size) = req.sample_size {
            experiment.sample_size = sample_size;
        }
        if let Some(confidence_level) = req.confidence_level {
            experiment.confidence_level = confidence_level;
        }
        if let Some(goal_event) = &req.goal_event {
            experiment.goal_event = goal_event.clone();
        }
        if bump_epoch {
            experiment.epoch += 1;
        }
        experiment.updated_at = now;

        validate_definition(&experiment)?;
    }

    if let Some(status) = req.status {
        apply_transition(&mut experiment, status, now)?;
    }

    Ok(experiment)
}

/// Structural checks shared by create and update
fn validate_definition(experiment: &Experiment) -> Result<()> {
    let name = experiment.name.trim();
    if name.is_empty() {
        return Err(ExperimentError::validation("experiment name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ExperimentError::validation(format!(
            "experiment name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }

    if experiment.variants.is_empty() {
        return Err(ExperimentError::validation(
            "at least one variant is required",
        ));
    }

    let mut ids = HashSet::new();
    for variant in &experiment.variants {
        if variant.id.trim().is_empty() {
            return Err(ExperimentError::validation("variant id cannot be empty"));
        }
        if !ids.insert(variant.id.as_str()) {
            return Err(ExperimentError::validation(format!(
                "duplicate variant id: {}",
                variant.id
            )));
        }
    }

    let allocated: HashSet<&str> = experiment.allocation.keys().map(String::as_str).collect();
    if allocated != ids {
        return Err(ExperimentError::validation(
            "allocation must list exactly the declared variant ids",
        ));
    }

    for (variant_id, weight) in &experiment.allocation {
        if *weight > 100 {
            return Err(ExperimentError::validation(format!(
                "allocation for '{}' must be between 0 and 100",
                variant_id
            )));
        }
    }
    let total: u32 = experiment.allocation.values().sum();
    if total != 100 {
        return Err(ExperimentError::validation(format!(
            "total allocation must equal 100%, got {}%",
            total
        )));
    }

    let controls = experiment.variants.iter().filter(|v| v.is_control).count();
    if controls > 1 {
        return Err(ExperimentError::validation(
            "at most one variant may be the control",
        ));
    }

    if let Some(confidence_level) = experiment.confidence_level {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(ExperimentError::validation(
                "confidence level must be between 0 and 1",
            ));
        }
        if controls != 1 {
            return Err(ExperimentError::validation(
                "significance testing requires exactly one control variant",
            ));
        }
    }

    if let Some(sample_size) = experiment.sample_size {
        if sample_size < 1 {
            return Err(ExperimentError::validation("sample size must be positive"));
        }
    }

    if let Some(percentage) = experiment.targeting.as_ref().and_then(|t| t.percentage) {
        if percentage > 100 {
            return Err(ExperimentError::validation(
                "targeting percentage must be between 0 and 100",
            ));
        }
    }

    if let (Some(start), Some(end)) = (experiment.start_date, experiment.end_date) {
        if start >= end {
            return Err(ExperimentError::validation(
                "start date must be before end date",
            ));
        }
    }

    Ok(())
}
