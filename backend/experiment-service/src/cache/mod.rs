//! Assignment cache
//!
//! Memoizes (experiment, subject) -> variant lookups. The cache is only an
//! accelerator: the store holds the authoritative assignment and a cold cache
//! is refilled from it. Entries carry no status-dependent TTL.

mod keys;
mod memory;
mod redis_cache;

pub use keys::{CacheKey, CACHE_VERSION};
pub use memory::InMemoryAssignmentCache;
pub use redis_cache::{RedisAssignmentCache, SharedRedis};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Assignment;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait AssignmentCache: Send + Sync {
    /// Cached assignment for the pair, if any
    async fn get(&self, experiment_id: Uuid, subject_id: &str)
        -> CacheResult<Option<Assignment>>;

    async fn put(&self, assignment: &Assignment) -> CacheResult<()>;

    /// Drop every cached assignment of an experiment; returns the number removed
    async fn invalidate_experiment(&self, experiment_id: Uuid) -> CacheResult<usize>;
}
