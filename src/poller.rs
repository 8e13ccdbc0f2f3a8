//! Background polling loop.
//!
//! One tokio task runs batch syncs on a configurable interval. The wait
//! between runs sleeps in one-second increments and re-checks both the
//! cancellation flag and the interval each tick, so `stop()` latency and
//! `set_interval()` pickup are bounded by a second, not by the interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::sync::{BatchOutcome, NewEventNotice, SyncEngine, SyncError, SyncFailure};
use crate::uspto::PatentDataSource;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Default interval; `start()` and `set_interval()` override it.
    pub interval_minutes: u64,
    /// How long `stop()` waits for the loop to observe cancellation.
    pub stop_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Structured outcomes delivered to whoever is listening.
#[derive(Debug, Clone)]
pub enum PollNotice {
    NewEvents(Vec<NewEventNotice>),
    Errors(Vec<SyncFailure>),
}

/// Cooperative cancellation flag shared with the polling task.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Poller<C: PatentDataSource + 'static> {
    engine: Arc<SyncEngine<C>>,
    notices: mpsc::UnboundedSender<PollNotice>,
    stop_timeout: Duration,
    interval_secs: Arc<AtomicU64>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
    worker: Mutex<Option<Worker>>,
}

impl<C: PatentDataSource + 'static> Poller<C> {
    pub fn new(
        engine: Arc<SyncEngine<C>>,
        config: PollerConfig,
        notices: mpsc::UnboundedSender<PollNotice>,
    ) -> Self {
        Self {
            engine,
            notices,
            stop_timeout: config.stop_timeout,
            interval_secs: Arc::new(AtomicU64::new(config.interval_minutes.max(1) * 60)),
            last_sync: Arc::new(RwLock::new(None)),
            worker: Mutex::new(None),
        }
    }

    /// Launch the background loop. A no-op if it is already running.
    pub fn start(&self, interval_minutes: u64) {
        let mut worker = self.worker.lock();
        if matches!(&*worker, Some(w) if !w.handle.is_finished()) {
            return;
        }

        self.interval_secs
            .store(interval_minutes.max(1) * 60, Ordering::SeqCst);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.engine),
            token.clone(),
            Arc::clone(&self.interval_secs),
            Arc::clone(&self.last_sync),
            self.notices.clone(),
        ));
        info!(interval_minutes, "polling started");
        *worker = Some(Worker { token, handle });
    }

    /// Signal the loop to exit and wait a bounded time for it to do so.
    /// An in-flight network call is not aborted; if the loop is still
    /// busy after the timeout, it will see the flag and exit on its own.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else { return };
        worker.token.cancel();
        match tokio::time::timeout(self.stop_timeout, worker.handle).await {
            Ok(_) => info!("polling stopped"),
            Err(_) => warn!("polling loop did not stop in time, detaching"),
        }
    }

    /// Run one sync immediately, outside the schedule, delivering any
    /// outcomes to the same channel. `AlreadyRunning` if the scheduled
    /// loop (or another caller) holds the sync gate.
    pub async fn poll_now(&self) -> Result<BatchOutcome, SyncError> {
        let batch = self.engine.sync_all().await?;
        *self.last_sync.write() = Some(Utc::now());
        if !batch.new_events.is_empty() {
            let _ = self
                .notices
                .send(PollNotice::NewEvents(batch.new_events.clone()));
        }
        if !batch.errors.is_empty() {
            let _ = self.notices.send(PollNotice::Errors(batch.errors.clone()));
        }
        Ok(batch)
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.worker.lock(), Some(w) if !w.handle.is_finished())
    }

    /// Change the interval. Picked up within a second even mid-wait.
    pub fn set_interval(&self, interval_minutes: u64) {
        self.interval_secs
            .store(interval_minutes.max(1) * 60, Ordering::SeqCst);
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }
}

async fn run_loop<C: PatentDataSource>(
    engine: Arc<SyncEngine<C>>,
    token: CancellationToken,
    interval_secs: Arc<AtomicU64>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
    notices: mpsc::UnboundedSender<PollNotice>,
) {
    loop {
        if token.is_cancelled() {
            return;
        }

        match engine.sync_all().await {
            Ok(batch) => {
                *last_sync.write() = Some(Utc::now());
                if !batch.new_events.is_empty() {
                    let _ = notices.send(PollNotice::NewEvents(batch.new_events));
                }
                if !batch.errors.is_empty() {
                    let _ = notices.send(PollNotice::Errors(batch.errors));
                }
            }
            // A foreground sync holds the gate; skip this cycle.
            Err(SyncError::AlreadyRunning) => {
                info!("sync already in flight, skipping scheduled run")
            }
            Err(e) => warn!(error = %e, "scheduled sync failed"),
        }

        let mut waited = 0u64;
        loop {
            if token.is_cancelled() {
                return;
            }
            let target = interval_secs.load(Ordering::SeqCst);
            if waited >= target {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += 1;
        }
    }
}
