//! # Circadian Clock: Scheduled Maintenance
//!
//! Jobs driven by `tokio-cron-scheduler`:
//!
//! | Job | Cadence (default) |
//! |---|---|
//! | route pending signals | 10 s |
//! | run pending tasks | 30 s |
//! | activity metrics | 1 h |
//! | health metrics | 5 min |
//! | cleanup | daily, 03:00 UTC |
//!
//! plus one routing and health run shortly after start. Each tick is a public
//! method so it can be driven directly; ticks log their errors and never fail.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::configs::ClockSettings;
use crate::core::auditory::{self, Auditory};
use crate::core::hippocampus::{self, Hippocampus};
use crate::core::limbic::{self, SignalBus};
use crate::core::motor::{self, Motor, ProcessReport};
use crate::core::plasticity::Plasticity;
use crate::core::signal::Metric;
use crate::error::{NeocortexError, Result};
use crate::store::Store;

/// Backlog size above which the health check warns.
pub const BACKLOG_WARN_THRESHOLD: u64 = 500;
const MIN_SIGNAL_RETENTION_DAYS: i64 = 7;

/// Figures written by the health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub signaux_non_traites: u64,
    pub actions24h: u64,
    pub taches_en_attente: u64,
}

/// Rows removed by a cleanup run. `historique` is only set on the first day of the month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub signaux: u64,
    pub notifications: u64,
    pub taches: u64,
    pub historique: Option<u64>,
}

fn scheduler_error(e: JobSchedulerError) -> NeocortexError {
    NeocortexError::Scheduler(format!("{:?}", e))
}

#[derive(Clone)]
pub struct Circadian {
    store: Arc<dyn Store>,
    bus: SignalBus,
    hippocampus: Hippocampus,
    auditory: Auditory,
    motor: Motor,
    plasticity: Plasticity,
    settings: ClockSettings,
    scheduler: Arc<Mutex<Option<JobScheduler>>>,
}

impl Circadian {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: SignalBus,
        hippocampus: Hippocampus,
        auditory: Auditory,
        motor: Motor,
        plasticity: Plasticity,
        settings: ClockSettings,
    ) -> Self {
        Self {
            store,
            bus,
            hippocampus,
            auditory,
            motor,
            plasticity,
            settings,
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether the scheduler is running.
    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    /// Registers every job and starts the scheduler. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let sched = JobScheduler::new().await.map_err(scheduler_error)?;
        let jobs = vec![
            self.repeated(self.settings.route_interval(), |c| async move {
                c.route_tick().await;
            })?,
            self.repeated(self.settings.task_interval(), |c| async move {
                c.task_tick().await;
            })?,
            self.repeated(self.settings.metrics_interval(), |c| async move {
                c.metrics_tick().await;
            })?,
            self.repeated(self.settings.health_interval(), |c| async move {
                c.health_tick().await;
            })?,
            self.cleanup_job()?,
            self.initial_job()?,
        ];
        for job in jobs {
            sched.add(job).await.map_err(scheduler_error)?;
        }
        sched.start().await.map_err(scheduler_error)?;

        *slot = Some(sched);
        info!("[Circadien] Clock started");
        Ok(())
    }

    /// Stops the scheduler. Jobs already running finish on their own.
    pub async fn stop(&self) -> Result<()> {
        if let Some(mut sched) = self.scheduler.lock().await.take() {
            sched.shutdown().await.map_err(scheduler_error)?;
            info!("[Circadien] Clock stopped");
        }
        Ok(())
    }

    fn repeated<F, Fut>(&self, every: Duration, tick: F) -> Result<Job>
    where
        F: Fn(Circadian) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = self.clone();
        let tick = Arc::new(tick);
        Job::new_repeated_async(every, move |_id, _sched| {
            let clock = clock.clone();
            let tick = Arc::clone(&tick);
            Box::pin(async move { tick(clock).await })
        })
        .map_err(scheduler_error)
    }

    fn cleanup_job(&self) -> Result<Job> {
        let clock = self.clone();
        Job::new_async(self.settings.cleanup_cron.as_str(), move |_id, _sched| {
            let clock = clock.clone();
            Box::pin(async move {
                clock.cleanup_tick(Utc::now()).await;
            })
        })
        .map_err(scheduler_error)
    }

    fn initial_job(&self) -> Result<Job> {
        let clock = self.clone();
        Job::new_one_shot_async(self.settings.initial_delay(), move |_id, _sched| {
            let clock = clock.clone();
            Box::pin(async move {
                clock.route_tick().await;
                clock.health_tick().await;
            })
        })
        .map_err(scheduler_error)
    }

    // ------------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------------

    /// Routes one batch of pending signals (`signal.batch_size`).
    pub async fn route_tick(&self) -> usize {
        let batch = self.plasticity.read_or("signal.batch_size", limbic::DEFAULT_BATCH_SIZE).await;
        match self.bus.route_pending(batch).await {
            Ok(n) => {
                if n > 0 {
                    info!("[Circadien] Routed {} signals", n);
                }
                n
            }
            Err(e) => {
                error!("[Circadien] Signal routing failed: {}", e);
                0
            }
        }
    }

    /// Runs one batch of tasks (`moteur.max_concurrent_tasks`).
    pub async fn task_tick(&self) -> ProcessReport {
        let batch = self
            .plasticity
            .read_or("moteur.max_concurrent_tasks", motor::DEFAULT_BATCH_SIZE)
            .await;
        match self.motor.process_pending(batch).await {
            Ok(report) => {
                if report.traitees > 0 {
                    info!(
                        "[Circadien] Tasks: {} ok, {} failed / {}",
                        report.reussies, report.echouees, report.traitees
                    );
                }
                report
            }
            Err(e) => {
                error!("[Circadien] Task processing failed: {}", e);
                ProcessReport::default()
            }
        }
    }

    pub async fn metrics_tick(&self) {
        self.hippocampus.compute_metrics().await;
        info!("[Circadien] Metrics computed");
    }

    /// Writes the health metrics and warns on a large backlog.
    pub async fn health_tick(&self) -> Option<HealthSnapshot> {
        match self.try_health().await {
            Ok(snapshot) => {
                if snapshot.signaux_non_traites > BACKLOG_WARN_THRESHOLD {
                    warn!("[Circadien] {} unprocessed signals", snapshot.signaux_non_traites);
                }
                Some(snapshot)
            }
            Err(e) => {
                error!("[Circadien] Health check failed: {}", e);
                None
            }
        }
    }

    async fn try_health(&self) -> Result<HealthSnapshot> {
        let since = Utc::now() - ChronoDuration::hours(24);
        let snapshot = HealthSnapshot {
            signaux_non_traites: self.store.count_pending_signals().await?,
            actions24h: self.store.activity_since(since).await?.total,
            taches_en_attente: self.motor.stats().await?.en_attente,
        };
        self.store
            .insert_metrics(&[
                Metric::count("systeme.signaux_non_traites", snapshot.signaux_non_traites, "minute"),
                Metric::count("systeme.actions_24h", snapshot.actions24h, "minute"),
                Metric::count("systeme.taches_en_attente", snapshot.taches_en_attente, "minute"),
            ])
            .await?;
        Ok(snapshot)
    }

    /// Daily purge. The audit trail is only purged when `now` is the first of the month.
    pub async fn cleanup_tick(&self, now: DateTime<Utc>) -> Option<CleanupReport> {
        match self.try_cleanup(now).await {
            Ok(report) => {
                info!(
                    "[Circadien] Cleanup: {} signals, {} notifications, {} tasks",
                    report.signaux, report.notifications, report.taches
                );
                if let Some(n) = report.historique {
                    info!("[Circadien] Monthly history purge: {} entries", n);
                }
                Some(report)
            }
            Err(e) => {
                error!("[Circadien] Cleanup failed: {}", e);
                None
            }
        }
    }

    async fn try_cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let ttl: i64 = self.plasticity.read_or("signal.ttl_default_seconds", 86_400).await;
        let signal_days = (ttl / 86_400).max(MIN_SIGNAL_RETENTION_DAYS);

        let mut report = CleanupReport {
            signaux: self.bus.purge(signal_days).await?,
            notifications: self.auditory.purge(auditory::DEFAULT_RETENTION_DAYS).await?,
            taches: self.motor.purge(motor::DEFAULT_RETENTION_DAYS).await?,
            historique: None,
        };

        if now.day() == 1 {
            let days: i64 = self
                .plasticity
                .read_or("historique.retention_jours", hippocampus::DEFAULT_RETENTION_DAYS)
                .await;
            report.historique = Some(self.hippocampus.purge(days).await?);
        }
        Ok(report)
    }
}
