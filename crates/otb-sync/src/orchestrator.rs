//! Runs a plan of sync jobs in order, each under its own timeout, and the cron
//! scheduler that triggers the daily plan.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use otb_core::{Domain, SyncStatus, SyncTarget};
use otb_storage::WipeScope;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{SyncConfig, SyncContext, SyncParams, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("--full and --daily are mutually exclusive")]
    FullAndDaily,
    #[error("no jobs selected")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub jobs: Vec<SyncTarget>,
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub pages: Option<u32>,
    pub timeout: Duration,
    pub full: bool,
    pub daily: bool,
    pub clean: bool,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
}

impl Default for JobPlan {
    fn default() -> Self {
        Self {
            jobs: Domain::ALL.iter().copied().map(SyncTarget::cbx).collect(),
            state: None,
            limit: None,
            pages: None,
            timeout: Duration::from_secs(crate::DEFAULT_JOB_TIMEOUT_SECS),
            full: false,
            daily: false,
            clean: false,
            start_year: None,
            end_year: None,
        }
    }
}

impl JobPlan {
    /// The scheduled run: every CBX domain for the current month.
    pub fn daily(timeout: Duration) -> Self {
        Self {
            daily: true,
            timeout,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.full && self.daily {
            return Err(PlanError::FullAndDaily);
        }
        if self.jobs.is_empty() {
            return Err(PlanError::Empty);
        }
        Ok(())
    }

    fn params_for(&self, target: SyncTarget) -> SyncParams {
        let now = Utc::now();
        let (year, month) = if self.daily {
            (Some(now.year()), Some(now.month()))
        } else {
            (None, None)
        };
        let state = match (&self.state, self.daily || self.full) {
            (Some(state), _) => state.clone(),
            (None, true) => "ALL".to_string(),
            (None, false) => otb_adapters::cbx::DEFAULT_PLAYER_STATE.to_string(),
        };
        SyncParams {
            year,
            month,
            state: (target.domain == Domain::Players).then_some(state),
            limit: self.limit,
            max_pages: self.pages,
            full: self.full,
            start_year: self.start_year,
            end_year: self.end_year,
            ..SyncParams::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub target: SyncTarget,
    pub status: JobStatus,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == JobStatus::Success)
    }
}

/// Runs each job of `plan` in order. A failing or timed-out job never stops the ones after it.
pub async fn run_jobs(ctx: &SyncContext, plan: &JobPlan) -> Result<RunSummary> {
    plan.validate()?;
    let run_id = Uuid::new_v4();
    info!(%run_id, jobs = plan.jobs.len(), full = plan.full, daily = plan.daily, "sync run started");

    let mut outcomes = Vec::with_capacity(plan.jobs.len());
    for target in &plan.jobs {
        let span = info_span!("sync_job", %run_id, target = %target);
        let outcome = run_one(ctx, plan, *target).instrument(span).await;
        outcomes.push(outcome);
    }

    let summary = RunSummary { run_id, outcomes };
    for outcome in &summary.outcomes {
        let (created, updated) = outcome
            .report
            .as_ref()
            .map(|r| (r.created, r.updated))
            .unwrap_or_default();
        info!(
            %run_id,
            target = %outcome.target,
            status = outcome.status.as_str(),
            created,
            updated,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "job summary"
        );
    }
    Ok(summary)
}

async fn run_one(ctx: &SyncContext, plan: &JobPlan, target: SyncTarget) -> JobOutcome {
    let started = Instant::now();
    let outcome = |status, report, error: Option<String>| JobOutcome {
        target,
        status,
        report,
        error,
        elapsed: started.elapsed(),
    };

    if plan.clean && !plan.full {
        match ctx.store.wipe(&WipeScope::for_target(target)).await {
            Ok(removed) => info!(removed, "clean: existing rows removed"),
            Err(err) => {
                error!(error = %err, "clean failed");
                return outcome(JobStatus::Failed, None, Some(format!("clean failed: {err}")));
            }
        }
    }

    let job = match ctx.begin(target).await {
        Ok(job) => job,
        Err(err) => return outcome(JobStatus::Failed, None, Some(format!("{err:#}"))),
    };
    let job_id = job.id;
    let params = plan.params_for(target);

    match tokio::time::timeout(plan.timeout, ctx.run(job.clone(), target, &params)).await {
        Ok(Ok(report)) => {
            let status = match report.status {
                SyncStatus::Success => JobStatus::Success,
                _ => JobStatus::Failed,
            };
            let error = report.error.clone().filter(|_| status != JobStatus::Success);
            outcome(status, Some(report), error)
        }
        Ok(Err(err)) => {
            error!(job_id, error = %format!("{err:#}"), "sync job errored");
            outcome(JobStatus::Failed, None, Some(format!("{err:#}")))
        }
        Err(_) => {
            let message = format!("timeout after {}s", plan.timeout.as_secs());
            warn!(job_id, "{message}");
            if let Err(err) = ctx.fail(job, message.clone()).await {
                error!(job_id, error = %format!("{err:#}"), "could not record timeout");
            }
            outcome(JobStatus::Timeout, None, Some(message))
        }
    }
}

/// One cron job per configured expression, each running `plan`. `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    ctx: Arc<SyncContext>,
    config: &SyncConfig,
    plan: JobPlan,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    plan.validate()?;

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &config.sync_crons {
        let ctx = Arc::clone(&ctx);
        let plan = plan.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let ctx = Arc::clone(&ctx);
            let plan = plan.clone();
            Box::pin(async move {
                match run_jobs(&ctx, &plan).await {
                    Ok(summary) if summary.all_succeeded() => {
                        info!(run_id = %summary.run_id, "scheduled sync finished")
                    }
                    Ok(summary) => warn!(run_id = %summary.run_id, "scheduled sync finished with failures"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "scheduled daily sync");
    }
    Ok(Some(sched))
}
