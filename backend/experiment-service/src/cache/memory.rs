use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{AssignmentCache, CacheResult};
use crate::models::Assignment;

/// Process-local assignment cache
#[derive(Clone, Default)]
pub struct InMemoryAssignmentCache {
    entries: Arc<DashMap<(Uuid, String), Assignment>>,
}

impl InMemoryAssignmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AssignmentCache for InMemoryAssignmentCache {
    async fn get(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
    ) -> CacheResult<Option<Assignment>> {
        Ok(self
            .entries
            .get(&(experiment_id, subject_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn put(&self, assignment: &Assignment) -> CacheResult<()> {
        self.entries.insert(
            (assignment.experiment_id, assignment.subject_id.clone()),
            assignment.clone(),
        );
        Ok(())
    }

    async fn invalidate_experiment(&self, experiment_id: Uuid) -> CacheResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|(exp_id, _), _| *exp_id != experiment_id);
        Ok(before.saturating_sub(self.entries.len()))
    }
}
