/// In-process `ExperimentStore` backed by `DashMap`.
///
/// Used when no `DATABASE_URL` is configured and by the test suites. Each
/// instance is fully isolated.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{ExperimentStore, StoreError, StoreResult};
use crate::models::{Assignment, Event, Experiment, ExperimentStatus};

#[derive(Clone, Default)]
pub struct InMemoryExperimentStore {
    experiments: Arc<DashMap<Uuid, Experiment>>,
    /// Unique name index: name -> owning experiment
    names: Arc<DashMap<String, Uuid>>,
    assignments: Arc<DashMap<Uuid, HashMap<String, Assignment>>>,
    events: Arc<DashMap<Uuid, Vec<Event>>>,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `id`; returns whether the claim is new
    fn reserve_name(&self, name: &str, id: Uuid) -> StoreResult<bool> {
        match self.names.entry(name.to_string()) {
            Entry::Occupied(owner) if *owner.get() == id => Ok(false),
            Entry::Occupied(_) => Err(StoreError::Duplicate(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(true)
            }
        }
    }

    fn release_name(&self, name: &str, id: Uuid) {
        self.names.remove_if(name, |_, owner| *owner == id);
    }
}

#[async_trait]
impl ExperimentStore for InMemoryExperimentStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<()> {
        if self.experiments.contains_key(&experiment.id) {
            return Err(StoreError::Duplicate(experiment.id.to_string()));
        }
        self.reserve_name(&experiment.name, experiment.id)?;
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn get_experiment(&self, id: Uuid) -> StoreResult<Option<Experiment>> {
        Ok(self.experiments.get(&id).map(|e| e.value().clone()))
    }

    async fn get_experiment_by_name(&self, name: &str) -> StoreResult<Option<Experiment>> {
        let Some(id) = self.names.get(name).map(|owner| *owner.value()) else {
            return Ok(None);
        };
        self.get_experiment(id).await
    }

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> StoreResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let id = experiment.id;
        let claimed = self.reserve_name(&experiment.name, id)?;

        let swapped = match self.experiments.get_mut(&id) {
            None => Err(StoreError::NotFound(id)),
            Some(stored) if stored.updated_at != expected_updated_at => Err(StoreError::Stale(id)),
            Some(mut stored) => Ok(std::mem::replace(&mut *stored, experiment.clone())),
        };

        match swapped {
            Ok(previous) => {
                if previous.name != experiment.name {
                    self.release_name(&previous.name, id);
                }
                Ok(())
            }
            Err(e) => {
                if claimed {
                    self.release_name(&experiment.name, id);
                }
                Err(e)
            }
        }
    }

    async fn upsert_assignment(&self, assignment: &Assignment) -> StoreResult<Assignment> {
        let mut by_subject = self.assignments.entry(assignment.experiment_id).or_default();
        let persisted = by_subject
            .entry(assignment.subject_id.clone())
            .or_insert_with(|| assignment.clone());
        Ok(persisted.clone())
    }

    async fn get_assignment(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
    ) -> StoreResult<Option<Assignment>> {
        Ok(self
            .assignments
            .get(&experiment_id)
            .and_then(|by_subject| by_subject.get(subject_id).cloned()))
    }

    async fn list_assignments(&self, experiment_id: Uuid) -> StoreResult<Vec<Assignment>> {
        let mut assignments: Vec<Assignment> = self
            .assignments
            .get(&experiment_id)
            .map(|by_subject| by_subject.values().cloned().collect())
            .unwrap_or_default();
        assignments.sort_by(|a, b| {
            a.assigned_at
                .cmp(&b.assigned_at)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        Ok(assignments)
    }

    async fn append_event(&self, event: &Event) -> StoreResult<()> {
        self.events
            .entry(event.experiment_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events(&self, experiment_id: Uuid) -> StoreResult<Vec<Event>> {
        Ok(self
            .events
            .get(&experiment_id)
            .map(|events| events.value().clone())
            .unwrap_or_default())
    }

    async fn reset_experiment(&self, experiment_id: Uuid) -> StoreResult<(u64, u64)> {
        let assignments = self
            .assignments
            .remove(&experiment_id)
            .map(|(_, by_subject)| by_subject.len() as u64)
            .unwrap_or(0);
        let events = self
            .events
            .remove(&experiment_id)
            .map(|(_, events)| events.len() as u64)
            .unwrap_or(0);
        Ok((assignments, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn assignment(experiment_id: Uuid, subject: &str, variant: &str) -> Assignment {
        Assignment {
            experiment_id,
            subject_id: subject.to_string(),
            variant_id: variant.to_string(),
            epoch: 0,
            assigned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_first_writer() {
        let store = InMemoryExperimentStore::new();
        let exp_id = Uuid::new_v4();

        let first = store
            .upsert_assignment(&assignment(exp_id, "u1", "control"))
            .await
            .unwrap();
        let second = store
            .upsert_assignment(&assignment(exp_id, "u1", "new"))
            .await
            .unwrap();

        assert_eq!(first.variant_id, "control");
        assert_eq!(second.variant_id, "control");
        assert_eq!(store.list_assignments(exp_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_persist_one_record() {
        let store = InMemoryExperimentStore::new();
        let exp_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let variant = if i % 2 == 0 { "a" } else { "b" };
                store
                    .upsert_assignment(&assignment(exp_id, "racer", variant))
                    .await
                    .unwrap()
            }));
        }

        let mut variants = std::collections::HashSet::new();
        for handle in handles {
            variants.insert(handle.await.unwrap().variant_id);
        }

        assert_eq!(variants.len(), 1, "All writers must observe the same record");
        assert_eq!(store.list_assignments(exp_id).await.unwrap().len(), 1);
    }

    fn experiment(name: &str) -> Experiment {
        let now = Utc::now();
        Experiment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            variants: Vec::new(),
            allocation: Default::default(),
            targeting: None,
            status: ExperimentStatus::Paused,
            start_date: None,
            end_date: None,
            sample_size: None,
            confidence_level: None,
            goal_event: None,
            epoch: 0,
            created_at: now,
            updated_at: now,
            created_by: None,
        }
    }

    #[tokio::test]
    async fn test_update_rejects_stale_write() {
        let store = InMemoryExperimentStore::new();
        let exp = experiment("stale");
        store.insert_experiment(&exp).await.unwrap();

        // Another writer completes the experiment first
        let mut completed = exp.clone();
        completed.status = ExperimentStatus::Completed;
        completed.updated_at = exp.updated_at + chrono::Duration::seconds(1);
        store.update_experiment(&completed, exp.updated_at).await.unwrap();

        let mut edited = exp.clone();
        edited.description = Some("late edit".to_string());
        edited.updated_at = exp.updated_at + chrono::Duration::seconds(2);
        let err = store
            .update_experiment(&edited, exp.updated_at)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Stale(id) if id == exp.id));

        let stored = store.get_experiment(exp.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Completed);
        assert!(stored.description.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_experiment_is_not_found() {
        let store = InMemoryExperimentStore::new();
        let exp = experiment("ghost");

        let err = store
            .update_experiment(&exp, exp.updated_at)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == exp.id));
        assert!(store.get_experiment_by_name("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_moves_name_index() {
        let store = InMemoryExperimentStore::new();
        let first = experiment("first");
        let second = experiment("second");
        store.insert_experiment(&first).await.unwrap();
        store.insert_experiment(&second).await.unwrap();

        let mut taken = second.clone();
        taken.name = "first".to_string();
        let err = store
            .update_experiment(&taken, second.updated_at)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let mut renamed = first.clone();
        renamed.name = "renamed".to_string();
        store
            .update_experiment(&renamed, first.updated_at)
            .await
            .unwrap();
        assert!(store.get_experiment_by_name("first").await.unwrap().is_none());
        assert_eq!(
            store.get_experiment_by_name("renamed").await.unwrap().map(|e| e.id),
            Some(first.id)
        );
        store.insert_experiment(&experiment("first")).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_renames_claim_name_once() {
        let store = InMemoryExperimentStore::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let exp = experiment(&format!("racer-{}", i));
            store.insert_experiment(&exp).await.unwrap();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut renamed = exp.clone();
                renamed.name = "winner".to_string();
                store.update_experiment(&renamed, exp.updated_at).await.is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);
        let named: Vec<_> = store
            .list_experiments(None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.name == "winner")
            .collect();
        assert_eq!(named.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_removes_assignments_and_events() {
        let store = InMemoryExperimentStore::new();
        let exp_id = Uuid::new_v4();
        store
            .upsert_assignment(&assignment(exp_id, "u1", "control"))
            .await
            .unwrap();
        store
            .append_event(&Event {
                id: Uuid::new_v4(),
                experiment_id: exp_id,
                variant_id: "control".to_string(),
                subject_id: "u1".to_string(),
                event_type: "view".into(),
                payload: serde_json::Value::Null,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.reset_experiment(exp_id).await.unwrap(), (1, 1));
        assert!(store.get_assignment(exp_id, "u1").await.unwrap().is_none());
        assert!(store.list_events(exp_id).await.unwrap().is_empty());
    }
}
