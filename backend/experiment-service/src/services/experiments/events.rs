/// Event Recorder - attributes outcome events to existing assignments
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::assignment::AssignmentEngine;
use crate::db::ExperimentStore;
use crate::error::Result;
use crate::metrics::helpers;
use crate::models::{Event, EventType, Experiment, ExperimentStatus};

/// What happened to a submitted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Stored against the subject's variant
    Recorded { variant_id: String },
    /// Subject has no assignment; the event was dropped
    Unassigned,
    /// Experiment is completed; its results no longer change
    ExperimentClosed,
}

impl RecordOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded { .. })
    }
}

/// One event of a batch
#[derive(Debug, Clone, Deserialize)]
pub struct EventInput {
    pub subject_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn ExperimentStore>,
    engine: AssignmentEngine,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn ExperimentStore>, engine: AssignmentEngine) -> Self {
        Self { store, engine }
    }

    pub async fn record(
        &self,
        experiment: &Experiment,
        subject_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        if experiment.status == ExperimentStatus::Completed {
            helpers::record_dropped_event("closed");
            debug!(
                experiment_id = %experiment.id,
                subject_id,
                event_type = %event_type,
                "Dropped event for completed experiment"
            );
            return Ok(RecordOutcome::ExperimentClosed);
        }

        let Some(assignment) = self.engine.lookup(experiment.id, subject_id).await? else {
            helpers::record_dropped_event("unassigned");
            warn!(
                experiment_id = %experiment.id,
                subject_id,
                event_type = %event_type,
                "Dropped event for unassigned subject"
            );
            return Ok(RecordOutcome::Unassigned);
        };

        let event = Event {
            id: Uuid::new_v4(),
            experiment_id: experiment.id,
            variant_id: assignment.variant_id,
            subject_id: subject_id.to_string(),
            event_type,
            payload,
            recorded_at: now,
        };
        self.store.append_event(&event).await?;
        helpers::record_event(&event.event_type);

        Ok(RecordOutcome::Recorded {
            variant_id: event.variant_id,
        })
    }

    /// Record events in order, one outcome per input.
    ///
    /// Stops at the first store error.
    pub async fn record_batch(
        &self,
        experiment: &Experiment,
        events: Vec<EventInput>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecordOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for input in events {
            outcomes.push(
                self.record(experiment, &input.subject_id, input.event_type, input.payload, now)
                    .await?,
            );
        }
        Ok(outcomes)
    }
}
