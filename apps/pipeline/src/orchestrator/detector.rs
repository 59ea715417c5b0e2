//! Status-change detection over the stored outcome stream.
//!
//! The detector pages through `responses` in insertion order, keeps the
//! current status of every check in memory and hands transitions to two
//! buffered writers: one upserting the `checks_status` snapshot, one
//! appending to `checks_status_changes`. The latest change doubles as the
//! resume marker after a restart.
//!
//! A check's first outcome moves it out of INIT, so every tracked check has
//! a change-log entry. The change log is appended in detection order, which
//! makes it the only state restored after a crash: the snapshot table can
//! lag or lead it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config;
use crate::database::{CheckStatus, Database, OutcomeRecord, Status};
use crate::error::{Error, Result};

pub type StatusMap = Arc<Mutex<HashMap<String, CheckStatus>>>;

/// Where the outcome stream is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeMarker {
    pub outcome_id: i64,
    /// Only true before the first page when starting from the earliest outcome
    pub inclusive: bool,
}

impl ResumeMarker {
    fn advance(&mut self, outcome_id: i64) {
        self.outcome_id = outcome_id;
        self.inclusive = false;
    }
}

/// Pick the resume point: the latest status change, else the earliest stored outcome.
pub async fn resolve_resume_marker(database: &dyn Database) -> Result<ResumeMarker> {
    if let Some(change) = database.latest_status_change().await.map_err(Error::storage)? {
        return Ok(ResumeMarker { outcome_id: change.status.outcome_id, inclusive: false });
    }

    match database.earliest_outcome().await.map_err(Error::storage)? {
        Some(OutcomeRecord { id: Some(id), .. }) => Ok(ResumeMarker { outcome_id: id, inclusive: true }),
        Some(_) => Err(Error::storage(anyhow::anyhow!("stored outcome has no id"))),
        None => Err(Error::NothingToMonitor),
    }
}

/// Rebuild the status map as it stood at the marker, from the latest change per check
pub async fn restore_statuses(
    database: &dyn Database,
    marker: ResumeMarker,
) -> Result<HashMap<String, CheckStatus>> {
    Ok(database
        .status_changes_up_to(marker.outcome_id)
        .await
        .map_err(Error::storage)?
        .into_iter()
        .map(|status| (status.check_id.clone(), status))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First outcome for the check: INIT moved to the observed status
    FirstSeen(CheckStatus),
    Changed(CheckStatus),
    Unchanged,
    /// Already reflected in the restored state
    Replayed,
}

/// Apply one outcome to the status map
pub fn observe(statuses: &mut HashMap<String, CheckStatus>, outcome: &OutcomeRecord) -> Observation {
    let outcome_id = outcome.id.unwrap_or_default();
    let observed = Status::from_success(outcome.success);

    let first_seen = !statuses.contains_key(&outcome.check_id);
    let entry = statuses.entry(outcome.check_id.clone()).or_insert_with(|| CheckStatus {
        check_id: outcome.check_id.clone(),
        current: Status::Init,
        current_since: outcome.processed_unix,
        previous: None,
        previous_since: None,
        previous_duration_secs: None,
        request_id: outcome.request_id,
        outcome_id,
    });

    if !first_seen && outcome_id <= entry.outcome_id {
        return Observation::Replayed;
    }
    if entry.current == observed {
        return Observation::Unchanged;
    }

    entry.previous = Some(entry.current);
    entry.previous_since = Some(entry.current_since);
    entry.previous_duration_secs = Some(outcome.processed_unix - entry.current_since);
    entry.current = observed;
    entry.current_since = outcome.processed_unix;
    entry.request_id = outcome.request_id;
    entry.outcome_id = outcome_id;
    if first_seen {
        Observation::FirstSeen(entry.clone())
    } else {
        Observation::Changed(entry.clone())
    }
}

/// A buffer drained by [`run_writer`]
#[async_trait]
trait StatusSink: Send {
    type Item: Send;

    fn push(&mut self, item: Self::Item);

    fn len(&self) -> usize;

    async fn flush(&mut self) -> Result<usize>;
}

/// Appends every change to the change log
struct ChangeLogWriter {
    database: Arc<dyn Database>,
    pending: Vec<CheckStatus>,
}

#[async_trait]
impl StatusSink for ChangeLogWriter {
    type Item = CheckStatus;

    fn push(&mut self, item: CheckStatus) {
        self.pending.push(item);
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    async fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.database.append_status_changes(&self.pending).await.map_err(Error::storage)?;
        let count = self.pending.len();
        self.pending.clear();
        debug!(count, "Appended status changes");
        Ok(count)
    }
}

/// Upserts the snapshot of every touched check, read from the map at flush time
struct SnapshotWriter {
    database: Arc<dyn Database>,
    statuses: StatusMap,
    pending: BTreeSet<String>,
}

#[async_trait]
impl StatusSink for SnapshotWriter {
    type Item = String;

    fn push(&mut self, check_id: String) {
        self.pending.insert(check_id);
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    async fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let rows: Vec<CheckStatus> = {
            let statuses = self.statuses.lock().await;
            self.pending.iter().filter_map(|id| statuses.get(id).cloned()).collect()
        };
        self.database.upsert_current_statuses(&rows).await.map_err(Error::storage)?;
        self.pending.clear();
        debug!(count = rows.len(), "Upserted current statuses");
        Ok(rows.len())
    }
}

/// Flush on size after each item and on every tick, then once more when the sender is gone
async fn run_writer<S: StatusSink>(
    mut sink: S,
    mut items: mpsc::Receiver<S::Item>,
    flush_size: usize,
    flush_interval: Duration,
) -> Result<()> {
    let mut tick = interval(flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = items.recv() => match item {
                Some(item) => {
                    sink.push(item);
                    if sink.len() >= flush_size {
                        sink.flush().await?;
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                sink.flush().await?;
            }
        }
    }
    sink.flush().await?;
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetectorStats {
    pub processed: u64,
    pub first_seen: u64,
    pub changes: u64,
}

pub struct Detector {
    database: Arc<dyn Database>,
    settings: config::Detector,
    statuses: StatusMap,
    marker: ResumeMarker,
    stats: DetectorStats,
}

impl Detector {
    /// Resolve the resume marker and restore the status map
    pub async fn start(settings: &config::Detector, database: Arc<dyn Database>) -> Result<Self> {
        let marker = resolve_resume_marker(database.as_ref()).await?;
        let restored = restore_statuses(database.as_ref(), marker).await?;
        info!(
            outcome_id = marker.outcome_id,
            inclusive = marker.inclusive,
            checks = restored.len(),
            "Resuming status detection"
        );

        Ok(Self {
            database,
            settings: settings.clone(),
            statuses: Arc::new(Mutex::new(restored)),
            marker,
            stats: DetectorStats::default(),
        })
    }

    /// Detect until cancelled, then let both writers flush and stop.
    pub async fn run(mut self, token: CancellationToken) -> Result<DetectorStats> {
        let flush_size = self.settings.flush_size.max(1);
        let flush_interval = Duration::from_millis(self.settings.flush_interval_ms.max(1));
        let capacity = self.settings.channel_capacity.max(1);

        let (changes_tx, changes_rx) = mpsc::channel(capacity);
        let (snapshots_tx, snapshots_rx) = mpsc::channel(capacity);

        let change_log = ChangeLogWriter { database: self.database.clone(), pending: Vec::new() };
        let snapshots = SnapshotWriter {
            database: self.database.clone(),
            statuses: self.statuses.clone(),
            pending: BTreeSet::new(),
        };
        let writers: [(&'static str, JoinHandle<Result<()>>); 2] = [
            ("change log writer", tokio::spawn(run_writer(change_log, changes_rx, flush_size, flush_interval))),
            ("snapshot writer", tokio::spawn(run_writer(snapshots, snapshots_rx, flush_size, flush_interval))),
        ];

        let detected = self.detect_loop(&token, &changes_tx, &snapshots_tx).await;
        drop(changes_tx);
        drop(snapshots_tx);

        let mut outcome = Ok(());
        for (name, handle) in writers {
            let result = handle.await.map_err(|e| Error::task(name, e)).and_then(|r| r);
            if let Err(e) = result {
                warn!(writer = name, error = %e, "Status writer failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        // a writer failure closes its channel, which is what stopped detection
        outcome?;
        detected?;

        info!(
            processed = self.stats.processed,
            changes = self.stats.changes,
            outcome_id = self.marker.outcome_id,
            "Detector stopped"
        );
        Ok(self.stats)
    }

    async fn detect_loop(
        &mut self,
        token: &CancellationToken,
        changes: &mpsc::Sender<CheckStatus>,
        snapshots: &mpsc::Sender<String>,
    ) -> Result<()> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        let page_size = self.settings.page_size.max(1);

        while !token.is_cancelled() {
            let page = self
                .database
                .outcomes_after(self.marker.outcome_id, self.marker.inclusive, page_size)
                .await
                .map_err(Error::storage)?;

            if page.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => continue,
                }
            }

            for outcome in &page {
                let changed = match observe(&mut *self.statuses.lock().await, outcome) {
                    Observation::FirstSeen(status) => {
                        self.stats.first_seen += 1;
                        Some(status)
                    }
                    Observation::Changed(status) => Some(status),
                    Observation::Unchanged | Observation::Replayed => None,
                };
                if let Some(status) = changed {
                    self.stats.changes += 1;
                    info!(
                        check_id = %status.check_id,
                        from = ?status.previous,
                        to = %status.current,
                        outcome_id = status.outcome_id,
                        "Check status changed"
                    );
                    snapshots.send(status.check_id.clone()).await.map_err(|_| writer_gone("snapshot"))?;
                    changes.send(status).await.map_err(|_| writer_gone("change log"))?;
                }
                self.stats.processed += 1;
                if let Some(id) = outcome.id {
                    self.marker.advance(id);
                }
            }
            debug!(count = page.len(), outcome_id = self.marker.outcome_id, "Processed outcome page");
        }
        Ok(())
    }
}

fn writer_gone(name: &'static str) -> Error {
    Error::Task { name, reason: "writer stopped".into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::testing::test_database;
    use uuid::Uuid;

    fn record(id: i64, check_id: &str, success: bool, processed_unix: i64) -> OutcomeRecord {
        OutcomeRecord {
            id: Some(id),
            request_id: Uuid::now_v7(),
            check_id: check_id.into(),
            success,
            processed_unix,
            received_unix: processed_unix,
            region: "eu".into(),
            subregion: "a".into(),
            payload: "{}".into(),
        }
    }

    fn settings() -> config::Detector {
        config::Detector {
            flush_size: 2,
            flush_interval_ms: 10,
            page_size: 2,
            poll_interval_ms: 10,
            channel_capacity: 8,
        }
    }

    #[test]
    fn test_first_outcome_leaves_init() {
        let mut statuses = HashMap::new();
        let Observation::FirstSeen(first) = observe(&mut statuses, &record(1, "chk", true, 100)) else {
            panic!("expected the first sighting");
        };
        assert_eq!(first.previous, Some(Status::Init));
        assert_eq!(first.current, Status::Ok);
        assert_eq!(first.previous_since, Some(100));
        assert_eq!(first.previous_duration_secs, Some(0));

        let Observation::Changed(change) = observe(&mut statuses, &record(2, "chk", false, 160)) else {
            panic!("expected a change");
        };
        assert_eq!(change.previous, Some(Status::Ok));
        assert_eq!(change.current, Status::Nok);
        assert_eq!(change.previous_since, Some(100));
        assert_eq!(change.previous_duration_secs, Some(60));
        assert_eq!(change.current_since, 160);

        assert_eq!(observe(&mut statuses, &record(3, "chk", false, 220)), Observation::Unchanged);
        assert_eq!(observe(&mut statuses, &record(2, "chk", true, 160)), Observation::Replayed);
    }

    #[test]
    fn test_first_failure_moves_init_to_nok() {
        let mut statuses = HashMap::new();
        let Observation::FirstSeen(first) = observe(&mut statuses, &record(1, "chk", false, 100)) else {
            panic!("expected the first sighting");
        };
        assert_eq!((first.previous, first.current), (Some(Status::Init), Status::Nok));
    }

    #[tokio::test]
    async fn test_resume_marker_resolution() {
        let (db, _dir) = test_database().await;
        assert!(matches!(resolve_resume_marker(db.as_ref()).await, Err(Error::NothingToMonitor)));

        let outcomes = vec![record(0, "a", true, 1), record(0, "a", false, 2)]
            .into_iter()
            .map(|r| OutcomeRecord { id: None, ..r })
            .collect::<Vec<_>>();
        db.insert_outcomes(&outcomes).await.unwrap();
        let marker = resolve_resume_marker(db.as_ref()).await.unwrap();
        assert!(marker.inclusive);

        let stored = db.outcomes_after(marker.outcome_id, true, 10).await.unwrap();
        let mut statuses = HashMap::new();
        let Observation::FirstSeen(first) = observe(&mut statuses, &stored[0]) else {
            panic!("expected the first sighting");
        };
        db.append_status_changes(&[first.clone()]).await.unwrap();
        let marker = resolve_resume_marker(db.as_ref()).await.unwrap();
        assert_eq!(marker, ResumeMarker { outcome_id: first.outcome_id, inclusive: false });

        let Observation::Changed(change) = observe(&mut statuses, &stored[1]) else {
            panic!("expected a change");
        };
        db.append_status_changes(&[change.clone()]).await.unwrap();

        let marker = resolve_resume_marker(db.as_ref()).await.unwrap();
        assert_eq!(marker, ResumeMarker { outcome_id: change.outcome_id, inclusive: false });
    }

    #[tokio::test]
    async fn test_detector_writes_changes_and_snapshots() {
        let (db, _dir) = test_database().await;
        let outcomes: Vec<OutcomeRecord> = [true, false, false]
            .iter()
            .enumerate()
            .map(|(i, ok)| OutcomeRecord { id: None, ..record(0, "chk", *ok, 100 + 60 * i as i64) })
            .collect();
        db.insert_outcomes(&outcomes).await.unwrap();

        let detector = Detector::start(&settings(), db.clone()).await.unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(detector.run(token.clone()));

        for _ in 0..200 {
            if db.latest_status_change().await.unwrap().is_some_and(|change| change.status.current == Status::Nok) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.first_seen, 1);
        assert_eq!(stats.changes, 2);

        let change = db.latest_status_change().await.unwrap().unwrap();
        assert_eq!(change.status.previous, Some(Status::Ok));
        assert_eq!(change.status.current, Status::Nok);
        assert_eq!(change.status.current_since, 160);

        let current = db.current_statuses().await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].current, Status::Nok);
    }
}
