//! Periodic results snapshot
//!
//! Recomputes results for every active experiment, publishes per-variant
//! conversion rates as gauges and logs winners when they first appear.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::{run_job_loop, JobContext, PeriodicJob};
use crate::metrics::helpers;
use crate::models::ExperimentStatus;
use crate::services::experiments::ExperimentService;

/// What the last run published for one experiment
struct Snapshot {
    name: String,
    variants: Vec<String>,
    winner: Option<String>,
}

impl Snapshot {
    fn clear_gauges(&self) {
        for variant in &self.variants {
            helpers::clear_conversion_rate(&self.name, variant);
        }
    }
}

pub struct ResultsSnapshotJob {
    service: ExperimentService,
    interval_secs: u64,
    /// Active experiments seen by the last run
    snapshots: DashMap<Uuid, Snapshot>,
}

impl ResultsSnapshotJob {
    pub fn new(service: ExperimentService, interval_secs: u64) -> Self {
        Self {
            service,
            interval_secs,
            snapshots: DashMap::new(),
        }
    }

    /// Winner recorded by the last run, if any
    pub fn last_winner(&self, experiment_id: Uuid) -> Option<String> {
        self.snapshots
            .get(&experiment_id)
            .and_then(|snapshot| snapshot.winner.clone())
    }

    /// Forget experiments that are no longer active and drop their gauges
    fn evict_inactive(&self, active: &HashSet<Uuid>) -> usize {
        let stale: Vec<Uuid> = self
            .snapshots
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !active.contains(id))
            .collect();

        for id in &stale {
            if let Some((_, snapshot)) = self.snapshots.remove(id) {
                snapshot.clear_gauges();
            }
        }
        stale.len()
    }
}

#[async_trait]
impl PeriodicJob for ResultsSnapshotJob {
    async fn run_once(&self, ctx: &JobContext) -> Result<()> {
        let start = Instant::now();
        let experiments = self
            .service
            .list_experiments(Some(ExperimentStatus::Active))
            .await?;

        let active: HashSet<Uuid> = experiments.iter().map(|e| e.id).collect();
        let evicted = self.evict_inactive(&active);

        let mut failed = 0usize;
        for experiment in &experiments {
            let results = match self.service.get_results(experiment.id).await {
                Ok(results) => results,
                Err(e) => {
                    failed += 1;
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        experiment_id = %experiment.id,
                        error = %e,
                        "Failed to compute experiment results"
                    );
                    continue;
                }
            };

            for variant in &results.variants {
                helpers::set_conversion_rate(
                    &experiment.name,
                    &variant.variant_id,
                    variant.conversion_rate,
                );
            }

            let snapshot = Snapshot {
                name: experiment.name.clone(),
                variants: results.variants.iter().map(|v| v.variant_id.clone()).collect(),
                winner: results.winner.clone(),
            };
            let previous = self.snapshots.insert(experiment.id, snapshot);
            let previous_winner = previous.and_then(|p| p.winner);
            if results.winner.is_some() && results.winner != previous_winner {
                info!(
                    correlation_id = %ctx.correlation_id,
                    experiment_id = %experiment.id,
                    name = %experiment.name,
                    winner = ?results.winner,
                    total_subjects = results.total_subjects,
                    "Experiment has a significant winner"
                );
            }
        }

        info!(
            correlation_id = %ctx.correlation_id,
            experiments = experiments.len(),
            evicted,
            failed,
            elapsed_ms = start.elapsed().as_millis(),
            "Results snapshot completed"
        );

        if failed > 0 && failed == experiments.len() {
            anyhow::bail!("results computation failed for all {} experiments", failed);
        }
        Ok(())
    }

    fn interval_sec(&self) -> u64 {
        self.interval_secs
    }

    fn name(&self) -> &str {
        "results_snapshot"
    }
}

/// Run the snapshot job until `shutdown` fires
pub async fn run_results_snapshot_loop(
    service: ExperimentService,
    interval_secs: u64,
    shutdown: broadcast::Receiver<()>,
) {
    let job = Arc::new(ResultsSnapshotJob::new(service, interval_secs));
    run_job_loop(job, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryAssignmentCache;
    use crate::db::InMemoryExperimentStore;
    use crate::metrics::gather_metrics;
    use crate::models::{CreateExperimentRequest, EventType, SubjectAttributes, Variant};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_snapshot_tracks_winner_until_paused() {
        let service = ExperimentService::new(
            Arc::new(InMemoryExperimentStore::new()),
            Arc::new(InMemoryAssignmentCache::new()),
        );
        let experiment = service
            .create_experiment(CreateExperimentRequest {
                name: "snapshot_winner".to_string(),
                description: None,
                variants: vec![
                    Variant {
                        id: "control".to_string(),
                        name: "Control".to_string(),
                        description: None,
                        config: json!({}),
                        is_control: true,
                    },
                    Variant {
                        id: "new".to_string(),
                        name: "New".to_string(),
                        description: None,
                        config: json!({}),
                        is_control: false,
                    },
                ],
                allocation: BTreeMap::from([("control".to_string(), 50), ("new".to_string(), 50)]),
                targeting: None,
                start_date: None,
                end_date: None,
                sample_size: None,
                confidence_level: Some(0.95),
                goal_event: None,
                created_by: None,
            })
            .await
            .unwrap();
        service.start_experiment(experiment.id).await.unwrap();

        // Everyone on "new" converts, nobody on control does
        for i in 0..400 {
            let subject = format!("subject-{}", i);
            let assigned = service
                .assign(experiment.id, &subject, &SubjectAttributes::default())
                .await
                .unwrap()
                .unwrap();
            if assigned.variant_id == "new" {
                service
                    .record_event(experiment.id, &subject, EventType::Conversion, json!({}))
                    .await
                    .unwrap();
            }
        }

        let service_handle = service.clone();
        let job = ResultsSnapshotJob::new(service, 60);
        job.run_once(&JobContext::new()).await.unwrap();

        assert_eq!(job.last_winner(experiment.id).as_deref(), Some("new"));
        assert!(gather_metrics().contains("experiment=\"snapshot_winner\""));

        // Paused experiments drop out of the snapshot and the gauges
        service_handle.pause_experiment(experiment.id).await.unwrap();
        job.run_once(&JobContext::new()).await.unwrap();

        assert!(job.last_winner(experiment.id).is_none());
        assert!(!gather_metrics().contains("experiment=\"snapshot_winner\""));
    }
}
