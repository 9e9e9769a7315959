//! Cron job lifecycle -- the registry of live jobs, keyed by timer id.
//!
//! Each open timer owns one spawned firing loop. The loop sleeps until the
//! next cron fire time, then spawns the run detached, so cancelling a job
//! stops future firings without interrupting a run already in flight.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use cron::Schedule as CronSchedule;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::model::{Timer, TimerStatus};
use crate::runner::RunOrchestrator;
use crate::storage::Persistence;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

/// Parse a cron expression, accepting both the 6/7-field form (with seconds)
/// and the classic 5-field form.
pub fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).or_else(|err| {
        if expression.split_whitespace().count() == 5 {
            CronSchedule::from_str(&format!("0 {}", expression)).map_err(|_| {
                ScheduleError::InvalidCron {
                    expression: expression.to_string(),
                    reason: err.to_string(),
                }
            })
        } else {
            Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: err.to_string(),
            })
        }
    })
}

struct JobHandle {
    task: JoinHandle<()>,
}

impl JobHandle {
    fn cancel(self) {
        self.task.abort();
    }
}

/// Owns all live cron jobs. Registration is idempotent per timer id: adding a
/// job for an id that already has one replaces it, and exactly one survives.
pub struct JobScheduler {
    jobs: Mutex<HashMap<i64, JobHandle>>,
    store: Arc<dyn Persistence>,
    orchestrator: Arc<RunOrchestrator>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn Persistence>, orchestrator: Arc<RunOrchestrator>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            orchestrator,
        }
    }

    /// Register a cron job for `timer`, replacing any existing job for the
    /// same id. An invalid expression leaves no job registered.
    pub async fn add_job(&self, timer: &Timer) -> Result<(), ScheduleError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.remove(&timer.id) {
            existing.cancel();
        }
        self.register_locked(&mut jobs, timer)
    }

    /// Cancel any existing job for the id, then re-register only when the
    /// timer is still open.
    pub async fn update_job(&self, timer: &Timer) -> Result<(), ScheduleError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.remove(&timer.id) {
            existing.cancel();
        }
        if timer.status != TimerStatus::Open {
            info!(timer = timer.id, "timer closed, job not re-registered");
            return Ok(());
        }
        self.register_locked(&mut jobs, timer)
    }

    /// Cancel and discard the job for `id`; a no-op when absent.
    pub async fn remove_job(&self, id: i64) {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.remove(&id) {
            existing.cancel();
            info!(timer = id, "job cancelled");
        }
    }

    /// Boot every open timer from persistence. The sole bulk-load path; a
    /// timer with an invalid schedule is skipped, never fatal.
    pub async fn init(&self) -> Result<()> {
        let timers = self.store.load_open_timers().await?;
        let total = timers.len();
        for timer in &timers {
            if let Err(e) = self.add_job(timer).await {
                warn!(timer = timer.id, error = %e, "skipping timer with invalid schedule");
            }
        }
        let live = self.job_count().await;
        info!(total, live, "initialized scheduled jobs");
        Ok(())
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn has_job(&self, id: i64) -> bool {
        self.jobs.lock().await.contains_key(&id)
    }

    fn register_locked(
        &self,
        jobs: &mut HashMap<i64, JobHandle>,
        timer: &Timer,
    ) -> Result<(), ScheduleError> {
        let schedule = parse_cron(&timer.cron_expression)?;
        let task = tokio::spawn(firing_loop(
            schedule,
            timer.clone(),
            self.orchestrator.clone(),
        ));
        jobs.insert(timer.id, JobHandle { task });
        info!(
            timer = timer.id,
            name = %timer.name,
            cron = %timer.cron_expression,
            "job registered"
        );
        Ok(())
    }
}

async fn firing_loop(schedule: CronSchedule, timer: Timer, orchestrator: Arc<RunOrchestrator>) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(timer = timer.id, "cron schedule has no future firings");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        info!(timer = timer.id, name = %timer.name, "timer fired");
        // The run executes detached from this loop; any error inside it is
        // caught here at the firing boundary and cannot unregister the job.
        let orchestrator = orchestrator.clone();
        let timer = timer.clone();
        tokio::spawn(async move {
            match orchestrator.run_task(&timer).await {
                Ok(Some(report)) => {
                    info!(timer = timer.id, status = %report.status, "scheduled run finished")
                }
                Ok(None) => {
                    warn!(timer = timer.id, "scheduled run aborted: incomplete configuration")
                }
                Err(e) => error!(timer = timer.id, error = %e, "scheduled run failed"),
            }
        });
    }
}
