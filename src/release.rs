//! Release timestamp lookup.
//!
//! The upstream batch marker selects the partition and the `Last-Modified`
//! header. Counts and partitions are immutable for a fixed release, so the
//! lookup is memoised for a short window rather than hitting the reference
//! table on every request.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use sqlx::PgPool;

use crate::errors::ApiError;

const REFRESH_INTERVAL: Duration = Duration::from_secs(90);

#[derive(Default)]
pub struct ReleaseTracker {
    cached: Mutex<Option<(Instant, NaiveDateTime)>>,
}

impl ReleaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the most recent released batch.
    pub async fn latest(&self, pool: &PgPool) -> Result<NaiveDateTime, ApiError> {
        if let Ok(guard) = self.cached.lock() {
            if let Some((fetched_at, timestamp)) = *guard {
                if fetched_at.elapsed() < REFRESH_INTERVAL {
                    return Ok(timestamp);
                }
            }
        }

        let timestamp: Option<NaiveDateTime> = sqlx::query_scalar(
            "SELECT MAX(timestamp) AS timestamp \
             FROM covid19.release_reference \
             WHERE released IS TRUE",
        )
        .fetch_one(pool)
        .await?;

        let Some(timestamp) = timestamp else {
            tracing::error!("no released batch in release_reference");
            return Err(ApiError::Internal);
        };

        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some((Instant::now(), timestamp));
        }

        Ok(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 5, 4)
            .unwrap()
            .and_hms_opt(16, 48, 9)
            .unwrap()
    }

    /// A pool that parses but never connects; any statement through it
    /// would fail, so reaching it from a test means the cache was skipped.
    fn unreachable_pool() -> PgPool {
        PgPool::connect_lazy("postgres://localhost:1/none").unwrap()
    }

    #[test]
    fn test_starts_empty() {
        let tracker = ReleaseTracker::new();
        assert!(tracker.cached.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_the_pool() {
        let tracker = ReleaseTracker::new();
        *tracker.cached.lock().unwrap() = Some((Instant::now(), timestamp()));

        let latest = tracker.latest(&unreachable_pool()).await.unwrap();
        assert_eq!(latest, timestamp());
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_refresh_the_entry() {
        let tracker = ReleaseTracker::new();
        let fetched_at = Instant::now();
        *tracker.cached.lock().unwrap() = Some((fetched_at, timestamp()));

        tracker.latest(&unreachable_pool()).await.unwrap();

        let (cached_at, cached) = tracker.cached.lock().unwrap().expect("entry kept");
        assert_eq!(cached_at, fetched_at);
        assert_eq!(cached, timestamp());
    }
}
