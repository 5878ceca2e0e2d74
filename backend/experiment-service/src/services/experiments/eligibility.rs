/// Eligibility evaluation - fails closed
use chrono::{DateTime, Utc};

use super::hashing::{bucket, ELIGIBILITY_SALT};
use crate::models::{Experiment, ExperimentStatus, SubjectAttributes, TargetingRules};

/// Decide whether a subject may be enrolled into an experiment right now.
///
/// Pure: no I/O and no clock reads besides the injected `now`.
pub fn is_eligible(
    experiment: &Experiment,
    subject_id: &str,
    attributes: &SubjectAttributes,
    now: DateTime<Utc>,
) -> bool {
    if experiment.status != ExperimentStatus::Active {
        return false;
    }

    if let Some(start) = experiment.start_date {
        if now < start {
            return false;
        }
    }
    if let Some(end) = experiment.end_date {
        if now > end {
            return false;
        }
    }

    let Some(rules) = &experiment.targeting else {
        return true;
    };

    if !matches_targeting(rules, attributes) {
        return false;
    }

    match rules.percentage {
        Some(percentage) => bucket(ELIGIBILITY_SALT, experiment.id, subject_id) < percentage,
        None => true,
    }
}

/// Attribute predicates only (no percentage cap)
pub fn matches_targeting(rules: &TargetingRules, attributes: &SubjectAttributes) -> bool {
    matches_dimension(&rules.user_types, attributes.user_type.as_deref())
        && matches_dimension(&rules.countries, attributes.country.as_deref())
        && matches_dimension(&rules.cities, attributes.city.as_deref())
        && matches_dimension(&rules.device_types, attributes.device_type.as_deref())
        && matches_dimension(&rules.platforms, attributes.platform.as_deref())
        && rules.custom.iter().all(|(key, accepted)| {
            accepted.is_empty()
                || attributes
                    .custom
                    .get(key)
                    .map_or(false, |value| accepted.contains(value))
        })
}

fn matches_dimension(accepted: &[String], value: Option<&str>) -> bool {
    if accepted.is_empty() {
        return true;
    }
    match value {
        Some(value) => accepted.iter().any(|a| a.eq_ignore_ascii_case(value)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Variant;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn experiment(targeting: Option<TargetingRules>) -> Experiment {
        let now = Utc::now();
        Experiment {
            id: Uuid::from_u128(99),
            name: "search_ranking".to_string(),
            description: None,
            variants: vec![Variant {
                id: "control".to_string(),
                name: "Control".to_string(),
                description: None,
                config: json!({}),
                is_control: true,
            }],
            allocation: BTreeMap::from([("control".to_string(), 100)]),
            targeting,
            status: ExperimentStatus::Active,
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

    #[test]
    fn test_inactive_experiment_is_closed() {
        let mut exp = experiment(None);
        let attrs = SubjectAttributes::default();
        for status in [
            ExperimentStatus::Draft,
            ExperimentStatus::Paused,
            ExperimentStatus::Completed,
        ] {
            exp.status = status;
            assert!(!is_eligible(&exp, "u1", &attrs, Utc::now()));
        }
    }

    #[test]
    fn test_absent_targeting_admits_everyone() {
        let exp = experiment(None);
        assert!(is_eligible(&exp, "u1", &SubjectAttributes::default(), Utc::now()));
    }

    #[test]
    fn test_country_membership_is_case_insensitive() {
        let exp = experiment(Some(TargetingRules {
            countries: vec!["US".to_string(), "CA".to_string()],
            ..Default::default()
        }));
        let mut attrs = SubjectAttributes {
            country: Some("us".to_string()),
            ..Default::default()
        };
        assert!(is_eligible(&exp, "u1", &attrs, Utc::now()));

        attrs.country = Some("DE".to_string());
        assert!(!is_eligible(&exp, "u1", &attrs, Utc::now()));

        attrs.country = None;
        assert!(!is_eligible(&exp, "u1", &attrs, Utc::now()));
    }

    #[test]
    fn test_dimensions_are_anded() {
        let exp = experiment(Some(TargetingRules {
            countries: vec!["US".to_string()],
            platforms: vec!["ios".to_string()],
            ..Default::default()
        }));
        let attrs = SubjectAttributes {
            country: Some("US".to_string()),
            platform: Some("android".to_string()),
            ..Default::default()
        };
        assert!(!is_eligible(&exp, "u1", &attrs, Utc::now()));
    }

    #[test]
    fn test_custom_attribute_values() {
        let exp = experiment(Some(TargetingRules {
            custom: BTreeMap::from([("tier".to_string(), vec![json!("gold"), json!(3)])]),
            ..Default::default()
        }));
        let mut attrs = SubjectAttributes::default();
        attrs.custom.insert("tier".to_string(), json!(3));
        assert!(is_eligible(&exp, "u1", &attrs, Utc::now()));

        attrs.custom.insert("tier".to_string(), json!("silver"));
        assert!(!is_eligible(&exp, "u1", &attrs, Utc::now()));
    }

    #[test]
    fn test_date_window() {
        let now = Utc::now();
        let mut exp = experiment(None);
        exp.start_date = Some(now + Duration::hours(1));
        assert!(!is_eligible(&exp, "u1", &SubjectAttributes::default(), now));

        exp.start_date = Some(now - Duration::hours(2));
        exp.end_date = Some(now - Duration::hours(1));
        assert!(!is_eligible(&exp, "u1", &SubjectAttributes::default(), now));
    }

    #[test]
    fn test_percentage_cap_boundaries() {
        let attrs = SubjectAttributes::default();
        let none = experiment(Some(TargetingRules {
            percentage: Some(0),
            ..Default::default()
        }));
        let all = experiment(Some(TargetingRules {
            percentage: Some(100),
            ..Default::default()
        }));

        for i in 0..200 {
            let subject = format!("s{}", i);
            assert!(!is_eligible(&none, &subject, &attrs, Utc::now()));
            assert!(is_eligible(&all, &subject, &attrs, Utc::now()));
        }
    }

    #[test]
    fn test_percentage_cap_excludes_expected_share() {
        let exp = experiment(Some(TargetingRules {
            percentage: Some(30),
            ..Default::default()
        }));
        let attrs = SubjectAttributes::default();
        let now = Utc::now();

        let admitted = (0..20_000)
            .filter(|i| is_eligible(&exp, &format!("subject-{}", i), &attrs, now))
            .count();
        let share = admitted as f64 / 20_000.0;
        assert!((share - 0.30).abs() < 0.02, "Admitted share {}", share);
    }
}
