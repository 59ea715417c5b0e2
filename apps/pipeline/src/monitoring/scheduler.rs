use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{CheckDefinition, JobEnvelope, RegionTarget, now_unix};
use crate::broker::MessageRouter;
use crate::config;
use crate::database::{Database, InFlightMarker};
use crate::error::{Error, Result};

/// First tick of a schedule anchored at `anchor_unix` that is not in the past.
///
/// Keeps the phase of `anchor + k * frequency` across restarts.
pub fn first_fire_unix(anchor_unix: i64, frequency_secs: u64, now_unix: i64) -> i64 {
    let frequency = frequency_secs.max(1) as i64;
    if now_unix <= anchor_unix {
        return anchor_unix;
    }
    let elapsed = now_unix - anchor_unix;
    let periods = (elapsed + frequency - 1) / frequency;
    anchor_unix + periods * frequency
}

enum Command {
    Fire { check: Arc<CheckDefinition>, scheduled_unix: i64 },
    Resume { timers: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub queued: u64,
    /// Fires that arrived while registration was still running
    pub dropped_while_paused: u64,
    /// Fires for checks without an enabled region
    pub skipped: u64,
    pub marker_failures: u64,
}

/// Owns everything a fire touches. Timer tasks only send it messages.
struct Dispatcher {
    router: Arc<MessageRouter>,
    database: Arc<dyn Database>,
    paused: bool,
    rng: StdRng,
    stats: DispatchStats,
    registered: usize,
    stale_after: Duration,
}

impl Dispatcher {
    fn eligible_targets(&self, check: &CheckDefinition) -> Vec<RegionTarget> {
        let known = &self.router.topology().targets;
        check.regions.iter().filter(|target| known.contains(target)).cloned().collect()
    }

    async fn fire(&mut self, check: &CheckDefinition, scheduled_unix: i64) -> Result<()> {
        if self.paused {
            self.stats.dropped_while_paused += 1;
            debug!(check_id = %check.check_id, "Scheduler paused, dropping job");
            return Ok(());
        }

        let targets = self.eligible_targets(check);
        let Some(target) = targets.choose(&mut self.rng) else {
            self.stats.skipped += 1;
            warn!(check_id = %check.check_id, "Check has no enabled region, nothing to dispatch");
            return Ok(());
        };

        let request_id = Uuid::now_v7();
        let queued_unix = now_unix();
        let job = JobEnvelope::new(check.snapshot(), request_id, scheduled_unix, queued_unix);
        let body = serde_json::to_vec(&job)?;
        self.router.publish_topic(&target.routing_key(), &body).await?;
        self.stats.queued += 1;
        debug!(check_id = %check.check_id, request_id = %request_id, region = %target, "Job queued");

        let marker = InFlightMarker { request_id, check_id: check.check_id.clone(), queued_unix };
        if let Err(e) = self.database.insert_inflight(&marker).await {
            self.stats.marker_failures += 1;
            warn!(request_id = %request_id, error = %e, "Failed to record in-flight marker");
        }
        Ok(())
    }

    async fn log_stats(&self) {
        let before = now_unix() - self.stale_after.as_secs() as i64;
        let stale = match self.database.stale_inflight(before).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count stale in-flight markers");
                0
            }
        };
        if stale > 0 {
            warn!(stale, "In-flight markers older than {:?} (lost jobs)", self.stale_after);
        }
        info!(
            timers = self.registered,
            queued = self.stats.queued,
            dropped = self.stats.dropped_while_paused,
            skipped = self.stats.skipped,
            marker_failures = self.stats.marker_failures,
            stale_inflight = stale,
            "Scheduler stats"
        );
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        stats_interval: Duration,
        token: CancellationToken,
    ) -> Result<DispatchStats> {
        let mut stats = interval_at(Instant::now() + stats_interval, stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = stats.tick() => self.log_stats().await,
                command = commands.recv() => match command {
                    Some(Command::Fire { check, scheduled_unix }) => self.fire(&check, scheduled_unix).await?,
                    Some(Command::Resume { timers }) => {
                        self.paused = false;
                        self.registered = timers;
                        info!(timers = self.registered, "Scheduler resumed");
                    }
                    None => break,
                },
            }
        }
        Ok(self.stats)
    }
}

/// Turns check definitions into timed jobs.
///
/// Each check gets its own timer task; fires are serialized through a single
/// dispatch task which stays paused until every timer is registered.
pub struct Scheduler {
    commands: mpsc::Sender<Command>,
    timers: HashMap<String, JoinHandle<()>>,
    token: CancellationToken,
    dispatcher: JoinHandle<Result<DispatchStats>>,
}

impl Scheduler {
    /// Spawn the dispatch task in its paused state
    pub fn start(
        settings: &config::Scheduler,
        router: Arc<MessageRouter>,
        database: Arc<dyn Database>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(settings.channel_capacity.max(1));
        let token = shutdown.child_token();
        let dispatcher = Dispatcher {
            router,
            database,
            paused: true,
            rng: StdRng::from_entropy(),
            stats: DispatchStats::default(),
            registered: 0,
            stale_after: Duration::from_secs(settings.stale_inflight_secs),
        };
        let stats_interval = Duration::from_secs(settings.stats_interval_secs.max(1));
        let dispatcher = tokio::spawn(dispatcher.run(receiver, stats_interval, token.clone()));
        Self { commands, timers: HashMap::new(), token, dispatcher }
    }

    /// Register one recurring timer for `check`.
    ///
    /// Returns `false` when the check is disabled or has no frequency.
    pub fn register(&mut self, check: CheckDefinition) -> Result<bool> {
        if !check.is_schedulable() {
            debug!(check_id = %check.check_id, "Skipping disabled check");
            return Ok(false);
        }
        if self.timers.contains_key(&check.check_id) {
            return Err(Error::DuplicateCheck(check.check_id));
        }

        let id = check.check_id.clone();
        let handle = tokio::spawn(run_timer(Arc::new(check), self.commands.clone(), self.token.clone()));
        self.timers.insert(id, handle);
        Ok(true)
    }

    /// Register every definition, then let the dispatcher start publishing
    pub async fn schedule_all(&mut self, definitions: Vec<CheckDefinition>) -> Result<usize> {
        let mut registered = 0;
        for check in definitions {
            if self.register(check)? {
                registered += 1;
            }
        }
        info!(registered, "Registered check timers");
        if self.commands.send(Command::Resume { timers: self.timers.len() }).await.is_err() {
            warn!("Dispatcher stopped before registration finished");
        }
        Ok(registered)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Run until `shutdown` fires or the dispatcher fails
    pub async fn run(self) -> Result<DispatchStats> {
        let Scheduler { commands, timers, token, dispatcher } = self;
        drop(commands);

        let result = match dispatcher.await {
            Ok(result) => result,
            Err(e) => Err(Error::task("scheduler dispatcher", e)),
        };
        token.cancel();
        for (_, timer) in timers {
            timer.abort();
        }
        result
    }
}

async fn run_timer(check: Arc<CheckDefinition>, commands: mpsc::Sender<Command>, token: CancellationToken) {
    let now = now_unix();
    let mut scheduled_unix = first_fire_unix(check.start_sched_unix, check.frequency_secs, now);
    let delay = Duration::from_secs((scheduled_unix - now).max(0) as u64);
    let period = Duration::from_secs(check.frequency_secs);

    let mut ticks = interval_at(Instant::now() + delay, period);
    // a stalled runtime catches up, a restart does not
    ticks.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let fire = Command::Fire { check: check.clone(), scheduled_unix };
        if commands.send(fire).await.is_err() {
            return;
        }
        scheduled_unix += check.frequency_secs as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, QueueSet, Topology};
    use crate::database::repository::testing::{check, drop_table, test_database};

    #[test]
    fn test_first_fire_keeps_phase() {
        assert_eq!(first_fire_unix(1000, 60, 900), 1000);
        assert_eq!(first_fire_unix(1000, 60, 1000), 1000);
        assert_eq!(first_fire_unix(1000, 60, 1001), 1060);
        assert_eq!(first_fire_unix(1000, 60, 1060), 1060);
        assert_eq!(first_fire_unix(1000, 60, 1190), 1240);
    }

    async fn router(broker: &MemoryBroker) -> Arc<MessageRouter> {
        let topology = Topology {
            exchange: "amq.topic".into(),
            request_queue_base: "requests".into(),
            response_queue: "responses".into(),
            prefetch_count: 10,
            targets: vec![RegionTarget::new("eu", "a"), RegionTarget::new("us", "x")],
        };
        let router = MessageRouter::new(
            Arc::new(broker.connector()),
            Arc::new(topology),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        router.init_publisher(QueueSet::AllRequests).await.unwrap();
        Arc::new(router)
    }

    fn dispatcher(router: Arc<MessageRouter>, database: Arc<dyn Database>) -> Dispatcher {
        Dispatcher {
            router,
            database,
            paused: true,
            rng: StdRng::seed_from_u64(7),
            stats: DispatchStats::default(),
            registered: 0,
            stale_after: Duration::from_secs(900),
        }
    }

    #[tokio::test]
    async fn test_fires_while_paused_are_dropped() {
        let broker = MemoryBroker::default();
        let (db, _dir) = test_database().await;
        let mut dispatcher = dispatcher(router(&broker).await, db.clone());
        let def = check("a", 60, &[("eu", "a")]);

        dispatcher.fire(&def, 100).await.unwrap();
        assert_eq!(dispatcher.stats.dropped_while_paused, 1);
        assert_eq!(broker.queue_len("requests.eu.a"), 0);

        dispatcher.paused = false;
        dispatcher.fire(&def, 160).await.unwrap();
        assert_eq!(dispatcher.stats.queued, 1);

        let job: JobEnvelope = serde_json::from_slice(&broker.drain("requests.eu.a")[0]).unwrap();
        assert_eq!(job.scheduled_unix, 160);
        assert_eq!(job.check.id, "a");
        assert_eq!(job.attempts, 0);
        assert_eq!(db.stale_inflight(i64::MAX).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_region_outside_catalogue_is_a_no_op() {
        let broker = MemoryBroker::default();
        let (db, _dir) = test_database().await;
        let mut dispatcher = dispatcher(router(&broker).await, db);
        dispatcher.paused = false;

        dispatcher.fire(&check("none", 60, &[]), 1).await.unwrap();
        dispatcher.fire(&check("unknown", 60, &[("ap", "z")]), 1).await.unwrap();
        assert_eq!(dispatcher.stats.skipped, 2);
        assert_eq!(dispatcher.stats.queued, 0);
    }

    #[tokio::test]
    async fn test_marker_failure_still_publishes() {
        let broker = MemoryBroker::default();
        let (db, _dir) = test_database().await;
        drop_table(&db, "checks_inflight").await;
        let mut dispatcher = dispatcher(router(&broker).await, db);
        dispatcher.paused = false;

        dispatcher.fire(&check("a", 60, &[("eu", "a")]), 1).await.unwrap();
        assert_eq!(dispatcher.stats.marker_failures, 1);
        assert_eq!(dispatcher.stats.queued, 1);
        assert_eq!(broker.queue_len("requests.eu.a"), 1);
    }

    #[tokio::test]
    async fn test_region_choice_covers_every_enabled_region() {
        let broker = MemoryBroker::default();
        let (db, _dir) = test_database().await;
        let mut dispatcher = dispatcher(router(&broker).await, db);
        dispatcher.paused = false;

        let def = check("multi", 60, &[("eu", "a"), ("us", "x")]);
        for tick in 0..40 {
            dispatcher.fire(&def, tick).await.unwrap();
        }
        let eu = broker.queue_len("requests.eu.a");
        let us = broker.queue_len("requests.us.x");
        assert_eq!(eu + us, 40);
        assert!(eu > 0 && us > 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_disabled_checks() {
        let broker = MemoryBroker::default();
        let (db, _dir) = test_database().await;
        let shutdown = CancellationToken::new();
        let mut scheduler = Scheduler::start(&config::Scheduler::default(), router(&broker).await, db, &shutdown);

        let mut disabled = check("off", 60, &[("eu", "a")]);
        disabled.enabled = false;
        assert!(!scheduler.register(disabled).unwrap());
        assert!(scheduler.register(check("a", 60, &[("eu", "a")])).unwrap());
        assert!(matches!(scheduler.register(check("a", 60, &[("eu", "a")])), Err(Error::DuplicateCheck(_))));
        assert_eq!(scheduler.timer_count(), 1);

        shutdown.cancel();
        scheduler.run().await.unwrap();
    }
}
