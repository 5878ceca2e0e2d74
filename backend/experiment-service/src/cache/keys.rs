//! Cache key schema
//!
//! Key format: v{VERSION}:exp:{kind}:{experiment_id}[:subject_id]

use uuid::Uuid;

/// Cache schema version - increment when changing key formats
pub const CACHE_VERSION: u32 = 1;

pub struct CacheKey;

impl CacheKey {
    /// Format: v1:exp:assign:{experiment_id}:{subject_id}
    pub fn assignment(experiment_id: Uuid, subject_id: &str) -> String {
        format!(
            "v{}:exp:assign:{}:{}",
            CACHE_VERSION, experiment_id, subject_id
        )
    }

    /// Pattern matching every assignment key of an experiment
    pub fn assignment_pattern(experiment_id: Uuid) -> String {
        format!("v{}:exp:assign:{}:*", CACHE_VERSION, experiment_id)
    }
}
