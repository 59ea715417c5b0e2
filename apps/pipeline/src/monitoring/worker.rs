use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checker::ProbeSet;
use super::types::{JobEnvelope, OutcomeEnvelope, RegionTarget, now_unix};
use crate::broker::{Delivery, MessageRouter};
use crate::config;
use crate::error::{Error, Result};

/// Lifecycle of one worker. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    New,
    Ready,
    Cooling,
    Stopped,
}

/// Per-worker metadata, written by its worker and read by the stats task
struct WorkerSlot {
    state: watch::Sender<WorkerState>,
    received: AtomicU64,
    failed: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::New);
        Self { state, received: AtomicU64::new(0), failed: AtomicU64::new(0) }
    }

    fn advance(&self, next: WorkerState) {
        self.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    fn current(&self) -> WorkerState {
        *self.state.borrow()
    }
}

/// Hands out one token every `1 / rate` seconds to whichever worker asks first
pub fn spawn_throttle(rate: u32, token: CancellationToken) -> (mpsc::Receiver<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let period = Duration::from_secs(1) / rate.max(1);
    let handle = tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticks.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => return,
                sent = tx.send(()) => if sent.is_err() { return },
            }
        }
    });
    (rx, handle)
}

struct WorkerContext {
    router: Arc<MessageRouter>,
    probes: ProbeSet,
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    throttle: Mutex<mpsc::Receiver<()>>,
    slots: Arc<[WorkerSlot]>,
    target: RegionTarget,
    hostname: String,
    response_queue: String,
    max_attempts: u32,
    retry_delay: Duration,
    grace_period: Duration,
    /// Stops taking new work and starts cooling
    token: CancellationToken,
    /// Process-wide, cancelled when a worker hits a fatal error
    shutdown: CancellationToken,
}

impl WorkerContext {
    async fn next_delivery(&self) -> Option<Delivery> {
        self.deliveries.lock().await.recv().await
    }

    async fn take_token(&self) {
        // a stopped throttle no longer limits anything
        let _ = self.throttle.lock().await.recv().await;
    }

    async fn run(self: Arc<Self>, index: usize) -> Result<()> {
        let slot = &self.slots[index];
        slot.advance(WorkerState::Ready);
        let mut last_delivery = Instant::now();

        loop {
            let delivery = if self.token.is_cancelled() {
                slot.advance(WorkerState::Cooling);
                let idle = last_delivery.elapsed();
                if idle >= self.grace_period {
                    break;
                }
                let remaining = self.grace_period - idle;
                match timeout(remaining, self.next_delivery()).await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        sleep(remaining).await;
                        continue;
                    }
                    Err(_) => continue,
                }
            } else {
                tokio::select! {
                    _ = self.token.cancelled() => continue,
                    delivery = self.next_delivery() => match delivery {
                        Some(delivery) => delivery,
                        None => {
                            self.token.cancelled().await;
                            continue;
                        }
                    },
                }
            };

            last_delivery = Instant::now();
            self.take_token().await;
            if let Err(e) = self.process(slot, delivery).await {
                slot.advance(WorkerState::Stopped);
                error!(worker = index, error = %e, "Worker failed, shutting down");
                self.shutdown.cancel();
                return Err(e);
            }
        }

        slot.advance(WorkerState::Stopped);
        debug!(worker = index, "Worker stopped");
        Ok(())
    }

    async fn process(&self, slot: &WorkerSlot, delivery: Delivery) -> Result<()> {
        // acked before processing: a crash mid-check loses the job instead of redelivering it
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to acknowledge delivery");
        }

        let job: JobEnvelope = serde_json::from_slice(&delivery.body).map_err(|e| {
            error!(payload = %String::from_utf8_lossy(&delivery.body), error = %e, "Malformed job envelope");
            Error::malformed(e, &delivery.body)
        })?;
        slot.received.fetch_add(1, Ordering::Relaxed);

        let outcome = self.execute(job).await;
        if !outcome.success {
            slot.failed.fetch_add(1, Ordering::Relaxed);
        }

        let body = serde_json::to_vec(&outcome)?;
        self.router.publish_direct(&self.response_queue, &body).await?;
        Ok(())
    }

    /// Run the probe, retrying negative results up to `max_attempts` in total
    async fn execute(&self, job: JobEnvelope) -> OutcomeEnvelope {
        let mut outcome = OutcomeEnvelope::received(job, &self.target, &self.hostname);
        let probe = self.probes.select(outcome.job.check.protocol);
        let started = Instant::now();

        loop {
            outcome.job.attempts += 1;
            match probe.execute(&outcome.job).await {
                Ok(report) => {
                    let success = report.success;
                    outcome.apply_report(report);
                    if success || outcome.job.attempts >= self.max_attempts {
                        break;
                    }
                    debug!(request_id = %outcome.job.request_id, attempt = outcome.job.attempts, "Check failed, retrying");
                    sleep(self.retry_delay).await;
                }
                Err(e) => {
                    outcome.apply_fatal(e.to_string());
                    break;
                }
            }
        }

        outcome.time_spent = started.elapsed().as_micros() as i64;
        outcome.processed_unix = now_unix();
        outcome.queued_return_unix = now_unix();
        outcome
    }
}

/// Fixed set of workers sharing one delivery channel and one throttle
pub struct WorkerPool {
    slots: Arc<[WorkerSlot]>,
    workers: Vec<JoinHandle<Result<()>>>,
    background: Vec<JoinHandle<()>>,
    token: CancellationToken,
    done: CancellationToken,
}

impl WorkerPool {
    /// Spawn `settings.concurrency` workers.
    ///
    /// Returns the sending half of the delivery channel, to be handed to the
    /// router's consumer.
    pub fn start(
        settings: &config::Worker,
        router: Arc<MessageRouter>,
        probes: ProbeSet,
        response_queue: String,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Sender<Delivery>) {
        let (sender, deliveries) = mpsc::channel(settings.channel_capacity.max(1));
        let token = shutdown.child_token();
        let done = CancellationToken::new();
        let (throttle, throttle_task) = spawn_throttle(settings.throttle_rate, done.clone());

        let slots: Arc<[WorkerSlot]> = (0..settings.concurrency.max(1)).map(|_| WorkerSlot::new()).collect();
        let context = Arc::new(WorkerContext {
            router,
            probes,
            deliveries: Mutex::new(deliveries),
            throttle: Mutex::new(throttle),
            slots: slots.clone(),
            target: settings.target(),
            hostname: settings.hostname.clone(),
            response_queue,
            max_attempts: settings.max_attempts.max(1),
            retry_delay: settings.retry_delay(),
            grace_period: settings.grace_period(),
            token: token.clone(),
            shutdown,
        });

        let workers = (0..slots.len()).map(|index| tokio::spawn(context.clone().run(index))).collect();
        let stats_interval = Duration::from_secs(settings.stats_interval_secs.max(1));
        let stats_task = tokio::spawn(report_stats(slots.clone(), sender.downgrade(), stats_interval, done.clone()));

        info!(
            workers = slots.len(),
            throttle = settings.throttle_rate,
            region = %settings.target(),
            hostname = %settings.hostname,
            "Worker pool started"
        );
        let pool = Self { slots, workers, background: vec![throttle_task, stats_task], token, done };
        (pool, sender)
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.slots.iter().map(WorkerSlot::current).collect()
    }

    /// Wait until every worker has reached READY
    pub async fn await_all_ready(&self, limit: Duration) -> Result<()> {
        let all_ready = async {
            for slot in self.slots.iter() {
                let mut state = slot.state.subscribe();
                let _ = state.wait_for(|state| *state >= WorkerState::Ready).await;
            }
        };
        match timeout(limit, all_ready).await {
            Ok(()) => {
                info!(workers = self.slots.len(), "All workers ready");
                Ok(())
            }
            Err(_) => {
                let ready = self.states().iter().filter(|state| **state >= WorkerState::Ready).count();
                Err(Error::WorkersNotReady { ready, total: self.slots.len(), timeout: limit })
            }
        }
    }

    /// Cancel the workers and wait for every one of them to stop.
    ///
    /// Each worker keeps draining buffered deliveries and stops once it has
    /// been idle for the grace period. Returns the first worker error.
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();
        info!("Worker pool cooling down");

        let mut first_error = None;
        for worker in self.workers {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(Error::task("worker", e)),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        self.done.cancel();
        for task in self.background {
            let _ = task.await;
        }
        info!("Worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }
}

async fn report_stats(
    slots: Arc<[WorkerSlot]>,
    deliveries: mpsc::WeakSender<Delivery>,
    every: Duration,
    done: CancellationToken,
) {
    let mut ticks = interval_at(Instant::now() + every, every);
    let mut last_total = 0u64;
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticks.tick() => {}
        }

        let total: u64 = slots.iter().map(|slot| slot.received.load(Ordering::Relaxed)).sum();
        let failed: u64 = slots.iter().map(|slot| slot.failed.load(Ordering::Relaxed)).sum();
        let buffered = deliveries.upgrade().map(|tx| tx.max_capacity() - tx.capacity()).unwrap_or(0);
        let cooling = slots.iter().filter(|slot| slot.current() == WorkerState::Cooling).count();
        let rate = (total - last_total) as f64 / every.as_secs_f64();
        last_total = total;

        info!(received = total, failed, buffered, cooling, rate = %format!("{rate:.1}/s"), "Worker pool stats");
        for (index, slot) in slots.iter().enumerate() {
            debug!(
                worker = index,
                state = ?slot.current(),
                received = slot.received.load(Ordering::Relaxed),
                failed = slot.failed.load(Ordering::Relaxed),
                "Worker stats"
            );
        }
    }
}
