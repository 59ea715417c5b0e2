use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Delivery;
use crate::config;
use crate::database::{Database, OutcomeRecord};
use crate::error::{Error, Result};
use crate::monitoring::types::{OutcomeEnvelope, now_unix};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub received: u64,
    pub flushed: u64,
    pub flushes: u64,
}

/// Buffers outcome envelopes and writes them to storage in batches.
///
/// A flush happens when the buffer reaches `flush_size` or when
/// `flush_interval` has passed since the previous flush, checked after each
/// received outcome.
pub struct Collector {
    database: Arc<dyn Database>,
    flush_size: usize,
    flush_interval: Duration,
    stats_interval: Duration,
    buffer: Vec<OutcomeRecord>,
    to_clear: Vec<Uuid>,
    last_flush: Instant,
    stats: CollectorStats,
}

impl Collector {
    pub fn new(settings: &config::Collector, database: Arc<dyn Database>) -> Self {
        Self {
            database,
            flush_size: settings.flush_size.max(1),
            flush_interval: Duration::from_secs(settings.flush_interval_secs),
            stats_interval: Duration::from_secs(settings.stats_interval_secs.max(1)),
            buffer: Vec::with_capacity(settings.flush_size),
            to_clear: Vec::with_capacity(settings.flush_size),
            last_flush: Instant::now(),
            stats: CollectorStats::default(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Consume until cancelled or the channel closes, then flush what is left
    pub async fn consume_loop(
        &mut self,
        deliveries: &mut mpsc::Receiver<Delivery>,
        token: CancellationToken,
    ) -> Result<CollectorStats> {
        let mut stats = interval_at(Instant::now() + self.stats_interval, self.stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = stats.tick() => {
                    info!(
                        received = self.stats.received,
                        flushed = self.stats.flushed,
                        buffered = self.buffer.len(),
                        "Collector stats"
                    );
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        self.receive(delivery).await?;
                        if self.should_flush() {
                            self.flush().await?;
                        }
                    }
                    None => break,
                },
            }
        }

        // deliveries already handed over by the consumer
        while let Ok(delivery) = deliveries.try_recv() {
            self.receive(delivery).await?;
        }
        self.flush().await?;
        info!(received = self.stats.received, flushed = self.stats.flushed, "Collector stopped");
        Ok(self.stats)
    }

    /// Decode one outcome and buffer it. The delivery is acked once buffered.
    pub async fn receive(&mut self, delivery: Delivery) -> Result<()> {
        let outcome: OutcomeEnvelope = serde_json::from_slice(&delivery.body).map_err(|e| {
            error!(payload = %String::from_utf8_lossy(&delivery.body), error = %e, "Malformed outcome envelope");
            Error::malformed(e, &delivery.body)
        })?;

        let record = OutcomeRecord::from_envelope(&outcome, now_unix())?;
        self.to_clear.push(record.request_id);
        self.buffer.push(record);
        self.stats.received += 1;

        if let Err(e) = delivery.ack().await {
            warn!(request_id = %outcome.job.request_id, error = %e, "Failed to acknowledge outcome");
        }
        Ok(())
    }

    pub fn should_flush(&self) -> bool {
        self.buffer.len() >= self.flush_size || self.last_flush.elapsed() >= self.flush_interval
    }

    /// Store the buffer, then clear the matching in-flight markers.
    ///
    /// A failed insert is returned as fatal and the buffer is not retried.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(0);
        }

        let count = self.buffer.len();
        self.database.insert_outcomes(&self.buffer).await.map_err(Error::storage)?;
        match self.database.delete_inflight(&self.to_clear).await {
            Ok(cleared) => debug!(count, cleared, "Flushed outcomes"),
            Err(e) => warn!(count, error = %e, "Stored outcomes but failed to clear in-flight markers"),
        }

        self.buffer.clear();
        self.to_clear.clear();
        self.last_flush = Instant::now();
        self.stats.flushed += count as u64;
        self.stats.flushes += 1;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, BrokerError};
    use crate::database::InFlightMarker;
    use crate::database::repository::testing::test_database;
    use crate::monitoring::types::{CheckSnapshot, JobEnvelope, Protocol, RegionTarget};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAcker(Arc<AtomicUsize>);

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn outcome(request_id: Uuid, success: bool) -> OutcomeEnvelope {
        let check = CheckSnapshot {
            id: "chk".into(),
            host: "http://127.0.0.1:9".into(),
            port: 9,
            protocol: Protocol::Http,
            sub_verb: "GET".into(),
            frequency: 60,
            regions: vec![RegionTarget::new("eu", "a")],
            owner: "owner".into(),
        };
        let job = JobEnvelope::new(check, request_id, 100, 100);
        let mut outcome = OutcomeEnvelope::received(job, &RegionTarget::new("eu", "a"), "host");
        outcome.success = success;
        outcome.processed_unix = 101;
        outcome
    }

    fn delivery(outcome: &OutcomeEnvelope, acks: &Arc<AtomicUsize>) -> Delivery {
        Delivery::new(serde_json::to_vec(outcome).unwrap(), Box::new(CountingAcker(acks.clone())))
    }

    fn settings(flush_size: usize, flush_interval_secs: u64) -> config::Collector {
        config::Collector { flush_size, flush_interval_secs, channel_capacity: 16, stats_interval_secs: 30 }
    }

    #[tokio::test]
    async fn test_flush_at_size_threshold_clears_exactly_those_markers() {
        let (db, _dir) = test_database().await;
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::now_v7()).collect();
        for id in &ids {
            db.insert_inflight(&InFlightMarker { request_id: *id, check_id: "chk".into(), queued_unix: 100 })
                .await
                .unwrap();
        }

        let acks = Arc::new(AtomicUsize::new(0));
        let mut collector = Collector::new(&settings(3, 3600), db.clone());
        for id in &ids[..2] {
            collector.receive(delivery(&outcome(*id, true), &acks)).await.unwrap();
            assert!(!collector.should_flush());
        }
        collector.receive(delivery(&outcome(ids[2], false), &acks)).await.unwrap();
        assert!(collector.should_flush());
        assert_eq!(acks.load(Ordering::SeqCst), 3);

        assert_eq!(collector.flush().await.unwrap(), 3);
        assert_eq!(collector.buffered(), 0);
        assert_eq!(db.stale_inflight(i64::MAX).await.unwrap(), 1);

        let stored = db.outcomes_after(0, false, 10).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(!stored[2].success);

        assert_eq!(collector.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_elapsed_interval_triggers_flush() {
        let (db, _dir) = test_database().await;
        let acks = Arc::new(AtomicUsize::new(0));
        let mut collector = Collector::new(&settings(1000, 0), db);
        collector.receive(delivery(&outcome(Uuid::now_v7(), true), &acks)).await.unwrap();
        assert!(collector.should_flush());
    }

    #[tokio::test]
    async fn test_consume_loop_flushes_on_shutdown() {
        let (db, _dir) = test_database().await;
        let acks = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(8);
        for _ in 0..5 {
            tx.send(delivery(&outcome(Uuid::now_v7(), true), &acks)).await.unwrap();
        }
        drop(tx);

        let mut collector = Collector::new(&settings(2, 3600), db.clone());
        let stats = collector.consume_loop(&mut rx, CancellationToken::new()).await.unwrap();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.flushed, 5);
        assert_eq!(stats.flushes, 3);
        assert_eq!(db.outcomes_after(0, false, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_malformed_outcome_is_fatal() {
        let (db, _dir) = test_database().await;
        let acks = Arc::new(AtomicUsize::new(0));
        let mut collector = Collector::new(&settings(2, 3600), db);
        let bad = Delivery::new(b"[]".to_vec(), Box::new(CountingAcker(acks.clone())));
        assert!(matches!(collector.receive(bad).await, Err(Error::MalformedEnvelope { .. })));
        assert_eq!(acks.load(Ordering::SeqCst), 0);
    }
}
