/// Statistics Engine - conversion rates, Wilson intervals and z-tests
///
/// Everything here is pure over a snapshot of assignments and events, so
/// recomputing over the same snapshot always yields the same results.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{Assignment, Event, Experiment, ExperimentStatus};

/// Per-variant results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub variant_name: String,
    pub is_control: bool,
    /// Distinct subjects assigned to the variant
    pub total_users: u64,
    /// Distinct assigned subjects with at least one goal event
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Wilson score interval (lower, upper)
    pub confidence_interval: (f64, f64),
    /// Versus control; `None` for the control itself or when not computable
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    /// (rate - control_rate) / control_rate
    pub relative_uplift: Option<f64>,
    pub is_winner: bool,
}

/// Experiment-level results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: Uuid,
    pub status: ExperimentStatus,
    pub confidence_level: f64,
    pub goal_event: String,
    /// In variant declaration order
    pub variants: Vec<VariantResult>,
    pub winner: Option<String>,
    pub total_subjects: u64,
    /// Every variant has at least `sample_size` subjects
    pub sample_size_reached: bool,
}

/// Compute results for an experiment from an assignment/event snapshot.
///
/// Assignments to unknown variants and events from subjects without a
/// matching assignment are ignored.
pub fn compute_results(
    experiment: &Experiment,
    assignments: &[Assignment],
    events: &[Event],
    default_goal: &str,
    default_confidence: f64,
) -> ExperimentResults {
    let goal = experiment.goal_event_or(default_goal).to_string();
    let confidence_level = experiment.confidence_level.unwrap_or(default_confidence);
    let z_critical = z_from_p(1.0 - (1.0 - confidence_level) / 2.0);

    // subject -> variant, restricted to declared variants
    let mut subject_variant: HashMap<&str, &str> = HashMap::new();
    for assignment in assignments {
        if assignment.experiment_id == experiment.id
            && experiment.variant(&assignment.variant_id).is_some()
        {
            subject_variant.insert(&assignment.subject_id, &assignment.variant_id);
        }
    }

    let mut users: HashMap<&str, u64> = HashMap::new();
    for variant_id in subject_variant.values() {
        *users.entry(variant_id).or_insert(0) += 1;
    }

    let mut converted: HashSet<(&str, &str)> = HashSet::new();
    for event in events {
        if event.experiment_id != experiment.id || event.event_type.as_str() != goal {
            continue;
        }
        if subject_variant.get(event.subject_id.as_str()) == Some(&event.variant_id.as_str()) {
            converted.insert((event.variant_id.as_str(), event.subject_id.as_str()));
        }
    }
    let mut conversions: HashMap<&str, u64> = HashMap::new();
    for (variant_id, _) in &converted {
        *conversions.entry(variant_id).or_insert(0) += 1;
    }

    let mut variants: Vec<VariantResult> = experiment
        .variants
        .iter()
        .map(|variant| {
            let total_users = users.get(variant.id.as_str()).copied().unwrap_or(0);
            let conversions = conversions.get(variant.id.as_str()).copied().unwrap_or(0);
            VariantResult {
                variant_id: variant.id.clone(),
                variant_name: variant.name.clone(),
                is_control: variant.is_control,
                total_users,
                conversions,
                conversion_rate: rate(conversions, total_users),
                confidence_interval: wilson_interval(conversions, total_users, z_critical),
                z_score: None,
                p_value: None,
                relative_uplift: None,
                is_winner: false,
            }
        })
        .collect();

    let winner = score_against_control(experiment, &mut variants, confidence_level);
    if let Some(winner_id) = &winner {
        for variant in variants.iter_mut() {
            variant.is_winner = &variant.variant_id == winner_id;
        }
    }

    let sample_size_reached = match experiment.sample_size {
        Some(required) => variants.iter().all(|v| v.total_users as i64 >= required),
        None => false,
    };

    ExperimentResults {
        experiment_id: experiment.id,
        status: experiment.status,
        confidence_level,
        goal_event: goal,
        total_subjects: subject_variant.len() as u64,
        variants,
        winner,
        sample_size_reached,
    }
}

/// Fill in z-scores, p-values and uplifts; returns the winning variant id.
fn score_against_control(
    experiment: &Experiment,
    variants: &mut [VariantResult],
    confidence_level: f64,
) -> Option<String> {
    let control_id = experiment.control()?.id.clone();
    let control = variants.iter().find(|v| v.variant_id == control_id)?.clone();
    if control.total_users == 0 || variants.iter().filter(|v| v.total_users > 0).count() < 2 {
        return None;
    }

    let alpha = 1.0 - confidence_level;
    let mut best_significant: Option<(String, f64)> = None;

    for variant in variants.iter_mut() {
        if variant.variant_id == control_id || variant.total_users == 0 {
            continue;
        }

        let (z, p) = two_proportion_z_test(
            control.conversions,
            control.total_users,
            variant.conversions,
            variant.total_users,
        );
        variant.z_score = Some(z);
        variant.p_value = Some(p);
        if control.conversion_rate > 0.0 {
            variant.relative_uplift =
                Some((variant.conversion_rate - control.conversion_rate) / control.conversion_rate);
        }

        if p < alpha {
            let beats_best = best_significant
                .as_ref()
                .map_or(true, |(_, best_rate)| variant.conversion_rate > *best_rate);
            if beats_best {
                best_significant = Some((variant.variant_id.clone(), variant.conversion_rate));
            }
        }
    }

    match best_significant {
        Some((id, best_rate)) if best_rate > control.conversion_rate => Some(id),
        Some((_, best_rate)) if best_rate < control.conversion_rate => Some(control_id),
        _ => None,
    }
}

fn rate(conversions: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        conversions as f64 / total as f64
    }
}

/// Wilson score interval, clamped to [0, 1]; `(0, 0)` without observations
pub fn wilson_interval(successes: u64, total: u64, z: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 0.0);
    }

    let n = total as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denominator;

    ((center - margin).max(0.0), (center + margin).min(1.0))
}

/// Pooled two-proportion z-test of `b` against `a`; returns (z, two-sided p).
///
/// A zero pooled standard error yields (0, 1).
pub fn two_proportion_z_test(
    conversions_a: u64,
    total_a: u64,
    conversions_b: u64,
    total_b: u64,
) -> (f64, f64) {
    if total_a == 0 || total_b == 0 {
        return (0.0, 1.0);
    }

    let n_a = total_a as f64;
    let n_b = total_b as f64;
    let p_a = conversions_a as f64 / n_a;
    let p_b = conversions_b as f64 / n_b;
    let pooled = (conversions_a + conversions_b) as f64 / (n_a + n_b);
    let se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();

    if se == 0.0 || !se.is_finite() {
        return (0.0, 1.0);
    }

    let z = (p_b - p_a) / se;
    let p_value = (2.0 * normal_sf(z.abs())).clamp(0.0, 1.0);
    (z, p_value)
}

/// Standard normal CDF
pub fn normal_cdf(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 - normal_sf(x)
    } else {
        normal_sf(-x)
    }
}

/// Upper tail of the standard normal for `z >= 0` (A&S 26.2.17)
fn normal_sf(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * z);
    let d = 0.3989422804014327; // 1/sqrt(2*pi)
    let density = d * (-z * z / 2.0).exp();

    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));

    density * poly
}

/// Inverse standard normal CDF (A&S 26.2.23, |error| < 4.5e-4)
pub fn z_from_p(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let (tail, sign) = if p < 0.5 { (p, -1.0) } else { (1.0 - p, 1.0) };
    let t = (-2.0 * tail.ln()).sqrt();

    let (c0, c1, c2) = (2.515517, 0.802853, 0.010328);
    let (d1, d2, d3) = (1.432788, 0.189269, 0.001308);

    sign * (t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t))
}
