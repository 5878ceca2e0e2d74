/// Lifecycle Controller - experiment state machine
use chrono::{DateTime, Utc};

use crate::error::{ExperimentError, Result};
use crate::models::{Experiment, ExperimentStatus};

/// Whether `from -> to` is an allowed edge
pub fn can_transition(from: ExperimentStatus, to: ExperimentStatus) -> bool {
    use ExperimentStatus::*;

    matches!(
        (from, to),
        (Draft, Active)
            | (Active, Paused)
            | (Paused, Active)
            | (Draft, Completed)
            | (Active, Completed)
            | (Paused, Completed)
    )
}

/// Validate a transition without touching any experiment
pub fn check_transition(from: ExperimentStatus, to: ExperimentStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(ExperimentError::InvalidTransition { from, to })
    }
}

/// Move an experiment to `to`, stamping its dates.
///
/// Activation is refused once `end_date` has passed. Completing an
/// experiment whose scheduled start is still ahead drops that start, so
/// the stored window stays ordered. On error the experiment is left
/// unchanged.
pub fn apply_transition(
    experiment: &mut Experiment,
    to: ExperimentStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    check_transition(experiment.status, to)?;

    match to {
        ExperimentStatus::Active => {
            if let Some(end) = experiment.end_date {
                if end <= now {
                    return Err(ExperimentError::validation(
                        "end date has passed, complete the experiment instead",
                    ));
                }
            }
            if experiment.start_date.is_none() {
                experiment.start_date = Some(now);
            }
        }
        ExperimentStatus::Completed => {
            if experiment.end_date.is_none() {
                if experiment.start_date.map_or(false, |start| start >= now) {
                    experiment.start_date = None;
                }
                experiment.end_date = Some(now);
            }
        }
        ExperimentStatus::Draft | ExperimentStatus::Paused => {}
    }

    experiment.status = to;
    experiment.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    const ALL: [ExperimentStatus; 4] = [
        ExperimentStatus::Draft,
        ExperimentStatus::Active,
        ExperimentStatus::Paused,
        ExperimentStatus::Completed,
    ];

    fn draft() -> Experiment {
        let now = Utc::now();
        Experiment {
            id: Uuid::new_v4(),
            name: "onboarding".to_string(),
            description: None,
            variants: Vec::new(),
            allocation: BTreeMap::new(),
            targeting: None,
            status: ExperimentStatus::Draft,
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
    fn test_completed_is_terminal() {
        for to in ALL {
            assert!(!can_transition(ExperimentStatus::Completed, to));
        }
    }

    #[test]
    fn test_self_transitions_rejected() {
        for status in ALL {
            assert!(matches!(
                check_transition(status, status),
                Err(ExperimentError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_nothing_returns_to_draft() {
        for from in ALL {
            assert!(!can_transition(from, ExperimentStatus::Draft));
        }
    }

    #[test]
    fn test_draft_cannot_be_paused() {
        assert!(!can_transition(ExperimentStatus::Draft, ExperimentStatus::Paused));
    }

    #[test]
    fn test_activation_stamps_start_date_once() {
        let mut exp = draft();
        let first = Utc::now();
        apply_transition(&mut exp, ExperimentStatus::Active, first).unwrap();
        assert_eq!(exp.start_date, Some(first));

        apply_transition(&mut exp, ExperimentStatus::Paused, Utc::now()).unwrap();
        apply_transition(&mut exp, ExperimentStatus::Active, Utc::now()).unwrap();
        assert_eq!(exp.start_date, Some(first));
    }

    #[test]
    fn test_completion_stamps_end_date() {
        let mut exp = draft();
        apply_transition(&mut exp, ExperimentStatus::Active, Utc::now()).unwrap();
        let done = Utc::now();
        apply_transition(&mut exp, ExperimentStatus::Completed, done).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Completed);
        assert_eq!(exp.end_date, Some(done));
    }

    #[test]
    fn test_failed_transition_leaves_state_unchanged() {
        let mut exp = draft();
        let before = exp.clone();
        let err = apply_transition(&mut exp, ExperimentStatus::Paused, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::InvalidTransition {
                from: ExperimentStatus::Draft,
                to: ExperimentStatus::Paused
            }
        ));
        assert_eq!(exp, before);
    }

    #[test]
    fn test_activation_after_end_date_rejected() {
        let now = Utc::now();
        let mut exp = draft();
        exp.end_date = Some(now - Duration::days(1));
        let before = exp.clone();

        let err = apply_transition(&mut exp, ExperimentStatus::Active, now).unwrap_err();
        assert!(matches!(err, ExperimentError::Validation(_)));
        assert_eq!(exp, before);
    }

    #[test]
    fn test_resume_after_end_date_rejected() {
        let now = Utc::now();
        let mut exp = draft();
        exp.start_date = Some(now - Duration::days(3));
        exp.end_date = Some(now - Duration::days(1));
        exp.status = ExperimentStatus::Paused;

        assert!(apply_transition(&mut exp, ExperimentStatus::Active, now).is_err());
        assert_eq!(exp.status, ExperimentStatus::Paused);
    }

    #[test]
    fn test_completing_before_scheduled_start_keeps_dates_ordered() {
        let now = Utc::now();
        let mut exp = draft();
        exp.start_date = Some(now + Duration::days(1));

        apply_transition(&mut exp, ExperimentStatus::Completed, now).unwrap();
        assert_eq!(exp.end_date, Some(now));
        assert_eq!(exp.start_date, None);
    }

    #[test]
    fn test_completion_keeps_past_start_date() {
        let now = Utc::now();
        let started = now - Duration::days(2);
        let mut exp = draft();
        exp.start_date = Some(started);

        apply_transition(&mut exp, ExperimentStatus::Completed, now).unwrap();
        assert_eq!(exp.start_date, Some(started));
        assert_eq!(exp.end_date, Some(now));
    }

    #[test]
    fn test_completion_keeps_scheduled_window() {
        let now = Utc::now();
        let mut exp = draft();
        exp.start_date = Some(now + Duration::days(1));
        exp.end_date = Some(now + Duration::days(2));
        let window = (exp.start_date, exp.end_date);

        apply_transition(&mut exp, ExperimentStatus::Completed, now).unwrap();
        assert_eq!((exp.start_date, exp.end_date), window);
    }
}
