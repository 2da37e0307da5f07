use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::sync::{mpsc, watch};

use crate::cache::JobCache;
use crate::models::DispatchRequest;
use crate::runs::RunTracker;
use crate::schedule::ScheduleParser;

// ---------------------------------------------------------------------------
// Clock trait + implementations
// ---------------------------------------------------------------------------

/// Trait for abstracting time, enabling deterministic testing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real clock backed by system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fake clock for deterministic testing. Time only advances when told to.
pub struct FakeClock {
    time: std::sync::RwLock<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: std::sync::RwLock::new(time),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        match self.time.write() {
            Ok(mut t) => *t = time,
            Err(poisoned) => *poisoned.into_inner() = time,
        }
    }

    pub fn advance(&self, duration: TimeDelta) {
        let now = self.now();
        self.set(now + duration);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        match self.time.read() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Truncate to the start of the minute.
fn minute_of(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::minutes(1)).unwrap_or(at)
}

// ---------------------------------------------------------------------------
// MaintenanceLoop
// ---------------------------------------------------------------------------

/// Periodic upkeep around the catalog.
///
/// Reconciles interrupted runs once at startup, then on every tick refreshes
/// the job cache, sends the active jobs due in the current minute over the
/// dispatch channel and enforces run retention. It never executes commands.
pub struct MaintenanceLoop {
    cache: Arc<JobCache>,
    tracker: Arc<RunTracker>,
    parser: Arc<dyn ScheduleParser>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
}

impl MaintenanceLoop {
    pub fn new(
        cache: Arc<JobCache>,
        tracker: Arc<RunTracker>,
        parser: Arc<dyn ScheduleParser>,
        clock: Arc<dyn Clock>,
        tick: Duration,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> Self {
        Self {
            cache,
            tracker,
            parser,
            clock,
            tick,
            dispatch_tx,
        }
    }

    pub async fn reconcile(&self) -> Result<u64> {
        let tracker = Arc::clone(&self.tracker);
        tokio::task::spawn_blocking(move || tracker.reconcile_after_restart())
            .await
            .context("Reconcile task panicked")?
            .context("Failed to reconcile interrupted runs")
    }

    /// Dispatch the jobs due at `minute`. Returns how many were sent.
    pub async fn dispatch_due(&self, minute: DateTime<Utc>) -> Result<usize> {
        let cache = Arc::clone(&self.cache);
        let jobs = tokio::task::spawn_blocking(move || cache.list_jobs())
            .await
            .context("Cache refresh task panicked")?
            .context("Failed to refresh job cache")?;

        let mut sent = 0;
        for job in jobs {
            if !job.active || !self.parser.is_due(&job.schedule, job.timezone, minute) {
                continue;
            }
            tracing::debug!("Job {} due at {}", job.job_id, minute);
            if self
                .dispatch_tx
                .send(DispatchRequest::new(job, minute))
                .await
                .is_err()
            {
                anyhow::bail!("Dispatch channel closed");
            }
            sent += 1;
        }
        Ok(sent)
    }

    pub async fn enforce_retention(&self) -> Result<u64> {
        let tracker = Arc::clone(&self.tracker);
        tokio::task::spawn_blocking(move || tracker.enforce_retention())
            .await
            .context("Retention task panicked")?
            .context("Failed to enforce run retention")
    }

    /// One pass: dispatch then retention. Errors are logged, not retried.
    async fn tick_once(&self, minute: DateTime<Utc>) -> Result<()> {
        match self.dispatch_due(minute).await {
            Ok(sent) if sent > 0 => tracing::info!("Dispatched {} job(s) for {}", sent, minute),
            Ok(_) => {}
            Err(e) => {
                if self.dispatch_tx.is_closed() {
                    return Err(e);
                }
                tracing::error!("Dispatch pass failed: {:#}", e);
            }
        }
        if let Err(e) = self.enforce_retention().await {
            tracing::error!("Retention pass failed: {:#}", e);
        }
        Ok(())
    }

    /// Run until `shutdown` fires or the dispatch channel closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<()>) -> Result<()> {
        let failed = self.reconcile().await?;
        tracing::info!(
            "Maintenance loop started (tick {:?}, {} interrupted run(s) failed)",
            self.tick,
            failed
        );

        let mut last_minute: Option<DateTime<Utc>> = None;
        loop {
            let minute = minute_of(self.clock.now());
            // Each minute is evaluated once, however short the tick.
            if last_minute != Some(minute) {
                self.tick_once(minute).await?;
                last_minute = Some(minute);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Maintenance loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
