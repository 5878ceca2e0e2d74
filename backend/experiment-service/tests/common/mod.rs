#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use experiment_service::cache::InMemoryAssignmentCache;
use experiment_service::db::InMemoryExperimentStore;
use experiment_service::models::{CreateExperimentRequest, TargetingRules, Variant};
use experiment_service::ExperimentService;
use serde_json::json;

pub fn variant(id: &str, is_control: bool) -> Variant {
    Variant {
        id: id.to_string(),
        name: id.to_uppercase(),
        description: None,
        config: json!({ "variant": id }),
        is_control,
    }
}

/// Request with the first arm as control
pub fn request(name: &str, arms: &[(&str, u32)]) -> CreateExperimentRequest {
    CreateExperimentRequest {
        name: name.to_string(),
        description: None,
        variants: arms
            .iter()
            .enumerate()
            .map(|(i, (id, _))| variant(id, i == 0))
            .collect(),
        allocation: arms
            .iter()
            .map(|(id, weight)| (id.to_string(), *weight))
            .collect::<BTreeMap<_, _>>(),
        targeting: None,
        start_date: None,
        end_date: None,
        sample_size: None,
        confidence_level: None,
        goal_event: None,
        created_by: None,
    }
}

pub fn targeted_request(name: &str, targeting: TargetingRules) -> CreateExperimentRequest {
    CreateExperimentRequest {
        targeting: Some(targeting),
        ..request(name, &[("control", 50), ("new", 50)])
    }
}

pub struct Harness {
    pub store: InMemoryExperimentStore,
    pub cache: InMemoryAssignmentCache,
    pub service: ExperimentService,
}

impl Harness {
    pub fn new() -> Self {
        let store = InMemoryExperimentStore::new();
        let cache = InMemoryAssignmentCache::new();
        let service = ExperimentService::new(Arc::new(store.clone()), Arc::new(cache.clone()));
        Self {
            store,
            cache,
            service,
        }
    }

    /// New service over the same store with an empty cache
    pub fn restarted(&self) -> ExperimentService {
        ExperimentService::new(
            Arc::new(self.store.clone()),
            Arc::new(InMemoryAssignmentCache::new()),
        )
    }
}
