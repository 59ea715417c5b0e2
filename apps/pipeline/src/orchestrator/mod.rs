/// Orchestrator module - starts and supervises one process role
///
/// Every role shares the same plumbing: a configuration, the pooled
/// database and a process-wide cancellation token. Roles that talk to other
/// processes get their own `MessageRouter`, so components only ever meet
/// through the broker.
///
/// - `collector` batches outcomes into storage
/// - `detector` turns stored outcomes into status changes
/// - `retention` purges old outcomes
pub mod collector;
pub mod detector;
pub mod retention;


pub use collector::{Collector, CollectorStats};
pub use detector::{Detector, DetectorStats, ResumeMarker};
pub use retention::{RetentionCleanup, RetentionPolicy};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{MemoryBroker, MessageRouter, QueueSet, Topology, connector_for};
use crate::config::Config;
use crate::database::{Database, DatabaseImpl};
use crate::error::{Error, Result};
use crate::monitoring::{ProbeSet, Scheduler, WorkerPool};
use crate::pool::open_pool;

/// Process role, one per subcommand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Scheduler,
    Worker,
    Collector,
    Detector,
    Retention,
    /// Scheduler, one worker pool, collector and detector in one process
    Standalone,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Scheduler => "scheduler",
            Role::Worker => "worker",
            Role::Collector => "collector",
            Role::Detector => "detector",
            Role::Retention => "retention",
            Role::Standalone => "standalone",
        }
    }
}

/// Shared resources of a pipeline process
pub struct Orchestrator {
    config: Arc<Config>,
    database: Arc<dyn Database>,
    memory: MemoryBroker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Open the database and bring its schema up to date
    pub async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        info!(path = %config.database.path, "Opening database");
        let pool = open_pool(&config.database.path, config.database.pool_size).await.map_err(Error::Storage)?;
        let database: Arc<dyn Database> = Arc::new(DatabaseImpl::new_from_pool(pool));
        Ok(Self::with_database(config, database, MemoryBroker::default(), shutdown))
    }

    /// Build over an existing database and in-process broker
    pub fn with_database(
        config: Config,
        database: Arc<dyn Database>,
        memory: MemoryBroker,
        shutdown: CancellationToken,
    ) -> Self {
        Self { config: Arc::new(config), database, memory, shutdown }
    }

    /// Run `role` until the shutdown token fires or the role fails
    pub async fn run(&self, role: Role) -> Result<()> {
        info!(role = role.as_str(), "Starting pipeline role");
        match role {
            Role::Scheduler => self.run_scheduler().await,
            Role::Worker => self.run_worker().await,
            Role::Collector => self.run_collector().await,
            Role::Detector => self.run_detector(false).await,
            Role::Retention => self.run_retention().await,
            Role::Standalone => self.run_standalone().await,
        }
    }

    fn router(&self) -> Result<Arc<MessageRouter>> {
        let connector = connector_for(&self.config.broker.url, &self.memory)?;
        let topology = Arc::new(Topology::from_config(&self.config));
        let backoff = Duration::from_millis(self.config.broker.reconnect_backoff_ms);
        Ok(Arc::new(MessageRouter::new(connector, topology, backoff, self.shutdown.clone())))
    }

    /// Load enabled checks, register their timers and dispatch until shutdown
    pub async fn run_scheduler(&self) -> Result<()> {
        let router = self.router()?;
        router.init_publisher(QueueSet::AllRequests).await?;

        let mut scheduler = Scheduler::start(&self.config.scheduler, router.clone(), self.database.clone(), &self.shutdown);
        let checks = self.database.enabled_checks().await.map_err(Error::storage)?;
        info!(checks = checks.len(), "Loaded enabled checks");

        let result = match scheduler.schedule_all(checks).await {
            Ok(_) => scheduler.run().await,
            Err(e) => {
                self.shutdown.cancel();
                let _ = scheduler.run().await;
                Err(e)
            }
        };
        close_router(&router).await;

        let stats = result?;
        info!(
            queued = stats.queued,
            dropped_while_paused = stats.dropped_while_paused,
            skipped = stats.skipped,
            marker_failures = stats.marker_failures,
            "Scheduler stopped"
        );
        Ok(())
    }

    /// Consume this region's job queue with a worker pool
    pub async fn run_worker(&self) -> Result<()> {
        let settings = &self.config.worker;
        let target = settings.target();
        info!(region = %target.region, subregion = %target.subregion, hostname = %settings.hostname, "Starting worker");

        if !self.config.enabled_targets().contains(&target) {
            return Err(Error::Config(format!("worker region `{target}` is not an enabled region")));
        }

        let router = self.router()?;
        router.init_publisher(QueueSet::Responses).await?;
        router.init_consumer(Some(target.clone())).await?;

        let topology = router.topology();
        let queue = topology.request_queue(&target);
        let probes = ProbeSet::new(settings.probe_timeout())
            .map_err(|e| Error::Config(format!("could not build the HTTP client: {e}")))?;
        let (pool, sink) =
            WorkerPool::start(settings, router.clone(), probes, topology.response_queue.clone(), self.shutdown.clone());

        if let Err(e) = pool.await_all_ready(settings.ready_timeout()).await {
            self.shutdown.cancel();
            close_router(&router).await;
            return Err(e);
        }

        let tag = format!("{}.{}", settings.hostname, target.routing_key());
        router.start_consuming(&tag, &queue, sink).await?;

        self.shutdown.cancelled().await;
        let consumer = router.cancel(&tag).await;
        let result = pool.shutdown().await;
        close_router(&router).await;
        result?;
        Ok(consumer?)
    }

    /// Batch outcomes from the response queue into storage
    pub async fn run_collector(&self) -> Result<()> {
        let settings = &self.config.collector;
        let router = self.router()?;
        router.init_consumer(None).await?;

        let (sink, mut deliveries) = mpsc::channel(settings.channel_capacity.max(1));
        let queue = router.topology().response_queue.clone();
        router.start_consuming("collector", &queue, sink).await?;

        let mut collector = Collector::new(settings, self.database.clone());
        // the loop ends once the consumer drops its sender on shutdown
        let result = collector.consume_loop(&mut deliveries, CancellationToken::new()).await;
        if result.is_err() {
            self.shutdown.cancel();
        }
        let consumer = router.close().await;
        result?;
        Ok(consumer?)
    }

    /// Follow stored outcomes and record status changes.
    ///
    /// With `wait_for_outcomes` an empty database is polled instead of being
    /// an error.
    pub async fn run_detector(&self, wait_for_outcomes: bool) -> Result<()> {
        let settings = &self.config.detector;
        let detector = loop {
            match Detector::start(settings, self.database.clone()).await {
                Err(Error::NothingToMonitor) if wait_for_outcomes => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_millis(settings.poll_interval_ms)) => {}
                    }
                }
                started => break started?,
            }
        };
        detector.run(self.shutdown.clone()).await.map(|_| ())
    }

    pub async fn run_retention(&self) -> Result<()> {
        let policy = RetentionPolicy::from_config(&self.config.retention);
        info!(days = policy.days, batch_size = policy.batch_size, "Starting retention cleanup");
        RetentionCleanup::new(self.database.clone(), policy).run(self.shutdown.clone()).await;
        Ok(())
    }

    /// Every role of the pipeline in one process.
    ///
    /// The first role to fail cancels the others.
    pub async fn run_standalone(&self) -> Result<()> {
        let (collector, detector, worker, scheduler) = tokio::join!(
            self.supervised(Role::Collector, self.run_collector()),
            self.supervised(Role::Detector, self.run_detector(true)),
            self.supervised(Role::Worker, self.run_worker()),
            self.supervised(Role::Scheduler, self.run_scheduler()),
        );
        scheduler.and(worker).and(collector).and(detector)
    }

    async fn supervised(&self, role: Role, task: impl Future<Output = Result<()>>) -> Result<()> {
        let result = task.await;
        if let Err(e) = &result {
            error!(role = role.as_str(), error = %e, "Role failed, stopping the others");
            self.shutdown.cancel();
        }
        result
    }
}

async fn close_router(router: &MessageRouter) {
    if let Err(e) = router.close().await {
        warn!(error = %e, "Broker link closed with an error");
    }
}
