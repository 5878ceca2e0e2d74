/// Redis-backed assignment cache
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AssignmentCache, CacheKey, CacheResult};
use crate::models::Assignment;

/// Shared Redis connection manager
pub type SharedRedis = Arc<Mutex<ConnectionManager>>;

const SCAN_BATCH: usize = 100;

#[derive(Clone)]
pub struct RedisAssignmentCache {
    redis: SharedRedis,
    /// Optional expiry; `None` keeps entries until explicitly invalidated
    ttl_secs: Option<u64>,
}

impl RedisAssignmentCache {
    pub fn new(redis: SharedRedis, ttl_secs: Option<u64>) -> Self {
        Self { redis, ttl_secs }
    }

    pub async fn connect(redis_url: &str, ttl_secs: Option<u64>) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Assignment cache connected to Redis");
        Ok(Self::new(Arc::new(Mutex::new(manager)), ttl_secs))
    }

    /// Clone the multiplexed connection so the lock is released before any command runs
    async fn connection(&self) -> ConnectionManager {
        self.redis.lock().await.clone()
    }
}

#[async_trait]
impl AssignmentCache for RedisAssignmentCache {
    async fn get(
        &self,
        experiment_id: Uuid,
        subject_id: &str,
    ) -> CacheResult<Option<Assignment>> {
        let key = CacheKey::assignment(experiment_id, subject_id);
        let mut conn = self.connection().await;
        let cached: Option<String> = conn.get(&key).await?;

        match cached {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, assignment: &Assignment) -> CacheResult<()> {
        let key = CacheKey::assignment(assignment.experiment_id, &assignment.subject_id);
        let serialized = serde_json::to_string(assignment)?;
        let mut conn = self.connection().await;

        match self.ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(&key, serialized, ttl).await?,
            None => conn.set::<_, _, ()>(&key, serialized).await?,
        }

        Ok(())
    }

    async fn invalidate_experiment(&self, experiment_id: Uuid) -> CacheResult<usize> {
        let pattern = CacheKey::assignment_pattern(experiment_id);
        let mut conn = self.connection().await;
        let mut removed = 0usize;

        // SCAN instead of KEYS so large experiments do not block Redis
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        debug!(
            experiment_id = %experiment_id,
            removed,
            "Invalidated assignment cache"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn assignment(experiment_id: Uuid, subject: &str) -> Assignment {
        Assignment {
            experiment_id,
            subject_id: subject.to_string(),
            variant_id: "control".to_string(),
            epoch: 0,
            assigned_at: Utc::now(),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_lookups_proceed_during_invalidation() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let cache = RedisAssignmentCache::connect(&url, Some(60)).await.unwrap();
        let busy = Uuid::new_v4();
        let other = Uuid::new_v4();

        for i in 0..2_000 {
            cache.put(&assignment(busy, &format!("u{}", i))).await.unwrap();
        }
        cache.put(&assignment(other, "reader")).await.unwrap();

        let (swept, found) = tokio::join!(
            cache.invalidate_experiment(busy),
            tokio::time::timeout(Duration::from_millis(200), cache.get(other, "reader")),
        );
        assert!(swept.unwrap() >= 2_000);
        assert!(found.unwrap().unwrap().is_some());

        cache.invalidate_experiment(other).await.unwrap();
    }
}
