/// Assignment Engine - deterministic, sticky variant assignment
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::eligibility::is_eligible;
use super::hashing::{bucket, VARIANT_SALT};
use crate::cache::AssignmentCache;
use crate::db::ExperimentStore;
use crate::error::{ExperimentError, Result};
use crate::metrics::helpers;
use crate::models::{Assignment, Experiment, SubjectAttributes, Variant};

/// Assignment response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentResponse {
    pub experiment_id: Uuid,
    pub subject_id: String,
    pub variant_id: String,
    pub variant_name: String,
    /// Opaque variant payload for the presentation layer
    pub config: serde_json::Value,
    pub assigned_at: DateTime<Utc>,
}

impl AssignmentResponse {
    /// `None` when the assignment points at a variant the experiment no longer declares
    pub fn build(experiment: &Experiment, assignment: Assignment) -> Option<Self> {
        let variant = experiment.variant(&assignment.variant_id)?;
        Some(Self {
            experiment_id: assignment.experiment_id,
            subject_id: assignment.subject_id,
            variant_name: variant.name.clone(),
            config: variant.config.clone(),
            variant_id: assignment.variant_id,
            assigned_at: assignment.assigned_at,
        })
    }
}

#[derive(Clone)]
pub struct AssignmentEngine {
    store: Arc<dyn ExperimentStore>,
    cache: Arc<dyn AssignmentCache>,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, cache: Arc<dyn AssignmentCache>) -> Self {
        Self { store, cache }
    }

    /// Assign a subject to a variant, or return their existing assignment.
    ///
    /// Existing assignments are returned as-is: eligibility is only checked
    /// before the first assignment. `Ok(None)` means the subject is not
    /// enrolled and should get the default experience.
    pub async fn assign(
        &self,
        experiment: &Experiment,
        subject_id: &str,
        attributes: &SubjectAttributes,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        // 1. Sticky lookup (cache, then store)
        if let Some(existing) = self.lookup(experiment.id, subject_id).await? {
            helpers::record_assignment("sticky");
            return Ok(Some(existing));
        }

        // 2. Gate new enrolments
        if !is_eligible(experiment, subject_id, attributes, now) {
            helpers::record_assignment("ineligible");
            debug!(
                experiment_id = %experiment.id,
                subject_id,
                "Subject not eligible"
            );
            return Ok(None);
        }

        // 3. Pick a variant
        let variant = select_variant(experiment, subject_id).ok_or_else(|| {
            ExperimentError::validation(format!("experiment {} has no variants", experiment.id))
        })?;

        // 4. Persist; a concurrent writer's record wins if it got there first
        let candidate = Assignment {
            experiment_id: experiment.id,
            subject_id: subject_id.to_string(),
            variant_id: variant.id.clone(),
            epoch: experiment.epoch,
            assigned_at: now,
        };
        let persisted = self.store.upsert_assignment(&candidate).await?;
        self.write_through(&persisted).await;

        helpers::record_assignment("new");
        info!(
            experiment_id = %experiment.id,
            subject_id,
            variant_id = %persisted.variant_id,
            epoch = persisted.epoch,
            "Assigned subject to variant"
        );

        Ok(Some(persisted))
    }

    /// Existing assignment only; never creates one
    pub async fn lookup(&self, experiment_id: Uuid, subject_id: &str) -> Result<Option<Assignment>> {
        match self.cache.get(experiment_id, subject_id).await {
            Ok(Some(cached)) => {
                helpers::record_cache_lookup("hit");
                debug!(experiment_id = %experiment_id, subject_id, "Assignment cache hit");
                return Ok(Some(cached));
            }
            Ok(None) => helpers::record_cache_lookup("miss"),
            Err(e) => {
                helpers::record_cache_lookup("error");
                warn!(
                    experiment_id = %experiment_id,
                    subject_id,
                    error = %e,
                    "Assignment cache read failed, falling back to store"
                );
            }
        }

        let stored = self.store.get_assignment(experiment_id, subject_id).await?;
        if let Some(assignment) = &stored {
            self.write_through(assignment).await;
        }
        Ok(stored)
    }

    /// Drop all cached assignments of an experiment
    pub async fn invalidate(&self, experiment_id: Uuid) {
        if let Err(e) = self.cache.invalidate_experiment(experiment_id).await {
            warn!(
                experiment_id = %experiment_id,
                error = %e,
                "Failed to invalidate assignment cache"
            );
        }
    }

    async fn write_through(&self, assignment: &Assignment) {
        if let Err(e) = self.cache.put(assignment).await {
            warn!(
                experiment_id = %assignment.experiment_id,
                subject_id = %assignment.subject_id,
                error = %e,
                "Failed to cache assignment"
            );
        }
    }
}

/// Map a subject onto a variant by walking cumulative allocations in
/// declaration order.
///
/// The last variant absorbs any remainder when allocations sum to less than
/// 100. Returns `None` only for an experiment without variants.
pub fn select_variant<'a>(experiment: &'a Experiment, subject_id: &str) -> Option<&'a Variant> {
    let bucket = bucket(VARIANT_SALT, experiment.id, subject_id);

    let mut cumulative = 0u32;
    for variant in &experiment.variants {
        cumulative += experiment.allocation.get(&variant.id).copied().unwrap_or(0);
        if bucket < cumulative {
            return Some(variant);
        }
    }

    experiment.variants.last()
}
