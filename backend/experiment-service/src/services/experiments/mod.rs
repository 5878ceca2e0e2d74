/// A/B Testing Framework - Core Services
pub mod assignment;
pub mod eligibility;
pub mod events;
pub mod experiment_service;
pub mod hashing;
pub mod lifecycle;
pub mod statistics;

pub use assignment::{select_variant, AssignmentEngine, AssignmentResponse};
pub use eligibility::is_eligible;
pub use events::{EventInput, EventRecorder, RecordOutcome};
pub use experiment_service::{ExperimentService, DEFAULT_CONFIDENCE_LEVEL};
pub use lifecycle::{apply_transition, can_transition, check_transition};
pub use statistics::{compute_results, ExperimentResults, VariantResult};
