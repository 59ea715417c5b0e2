//! Periodic purge of stored outcomes.
//!
//! Every cycle deletes outcomes received more than `days` ago, oldest
//! first, in batches of at most `batch_size` rows until none remain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config;
use crate::database::Database;
use crate::monitoring::types::now_unix;

/// How long outcomes are kept and how they are deleted
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub days: u64,
    pub batch_size: usize,
    pub interval: Duration,
}

impl RetentionPolicy {
    pub fn from_config(settings: &config::Retention) -> Self {
        Self {
            days: settings.days,
            batch_size: settings.batch_size.max(1),
            interval: Duration::from_secs(settings.interval_secs.max(1)),
        }
    }

    fn retention_seconds(&self) -> i64 {
        (self.days * 24 * 3600) as i64
    }

    pub fn cutoff(&self, now_unix: i64) -> i64 {
        now_unix - self.retention_seconds()
    }
}

/// Cleanup manager for expired outcomes
pub struct RetentionCleanup {
    database: Arc<dyn Database>,
    policy: RetentionPolicy,
}

impl RetentionCleanup {
    pub fn new(database: Arc<dyn Database>, policy: RetentionPolicy) -> Self {
        Self { database, policy }
    }

    /// Delete everything older than the cutoff, one batch at a time
    pub async fn purge_expired(&self, now_unix: i64) -> Result<u64> {
        let cutoff = self.policy.cutoff(now_unix);
        let mut total = 0;
        loop {
            let deleted = self.database.purge_outcomes_before(cutoff, self.policy.batch_size).await?;
            total += deleted;
            debug!(deleted, cutoff, "Purged outcome batch");
            if deleted < self.policy.batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }

    /// Purge on every interval until cancelled. Failures wait for the next cycle.
    pub async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.purge_expired(now_unix()).await {
                Ok(0) => debug!("No expired outcomes"),
                Ok(deleted) => info!(deleted, days = self.policy.days, "Retention cleanup completed"),
                Err(e) => warn!(error = %e, "Retention cleanup failed"),
            }
        }
        info!("Retention cleanup stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::OutcomeRecord;
    use crate::database::repository::testing::test_database;
    use uuid::Uuid;

    fn outcome(received_unix: i64) -> OutcomeRecord {
        OutcomeRecord {
            id: None,
            request_id: Uuid::now_v7(),
            check_id: "chk".into(),
            success: true,
            processed_unix: received_unix,
            received_unix,
            region: "eu".into(),
            subregion: "a".into(),
            payload: "{}".into(),
        }
    }

    #[test]
    fn test_cutoff_calculation() {
        let policy = RetentionPolicy::from_config(&config::Retention { days: 7, batch_size: 0, interval_secs: 0 });
        assert_eq!(policy.cutoff(1_000_000), 1_000_000 - 7 * 24 * 3600);
        assert_eq!(policy.batch_size, 1);
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_outcomes_in_batches() {
        let (db, _dir) = test_database().await;
        let now = 10 * 24 * 3600;
        let mut outcomes: Vec<OutcomeRecord> = (0..5).map(outcome).collect();
        outcomes.push(outcome(now));
        db.insert_outcomes(&outcomes).await.unwrap();

        let policy = RetentionPolicy { days: 1, batch_size: 2, interval: Duration::from_secs(60) };
        let cleanup = RetentionCleanup::new(db.clone(), policy);
        assert_eq!(cleanup.purge_expired(now).await.unwrap(), 5);

        let left = db.outcomes_after(0, false, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].received_unix, now);
        assert_eq!(cleanup.purge_expired(now).await.unwrap(), 0);
    }
}
