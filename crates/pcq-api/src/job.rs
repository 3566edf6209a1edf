//! Entry point used by the external scheduler.
//!
//! The process runs the disposer only when `TASK_NAME` selects it. Failures are
//! logged and reported, never propagated: the scheduler retries on its next run.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::disposal::{DisposalEngine, DisposalOutcome, RetentionStore};

pub const TASK_NAME_VAR: &str = "TASK_NAME";
pub const DISPOSER_TASK: &str = "pcq-disposer";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTrigger {
    task_name: Option<String>,
}

impl JobTrigger {
    #[must_use]
    pub fn new(task_name: Option<String>) -> Self {
        Self { task_name }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var(TASK_NAME_VAR).ok())
    }

    #[must_use]
    pub fn disposer() -> Self {
        Self::new(Some(DISPOSER_TASK.to_string()))
    }

    #[must_use]
    pub fn selects_disposer(&self) -> bool {
        self.task_name.as_deref().map(str::trim) == Some(DISPOSER_TASK)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    NotSelected,
    Finished { outcome: DisposalOutcome },
    Failed { error: String, cause: String },
}

/// Run the disposal job if `trigger` selects it, swallowing and logging any failure.
pub fn run_disposal_job<S, F>(
    trigger: &JobTrigger,
    engine: &DisposalEngine,
    open_store: F,
) -> JobReport
where
    S: RetentionStore,
    F: FnOnce() -> Result<S>,
{
    run_disposal_job_at(trigger, engine, open_store, OffsetDateTime::now_utc())
}

pub fn run_disposal_job_at<S, F>(
    trigger: &JobTrigger,
    engine: &DisposalEngine,
    open_store: F,
    now: OffsetDateTime,
) -> JobReport
where
    S: RetentionStore,
    F: FnOnce() -> Result<S>,
{
    if !trigger.selects_disposer() {
        tracing::info!("{TASK_NAME_VAR} does not select {DISPOSER_TASK}; no job to run");
        return JobReport::NotSelected;
    }

    tracing::info!("Starting PCQ disposer job");
    match engine.dispose_pcq_with(open_store, now) {
        Ok(outcome) => {
            tracing::info!("PCQ disposer job finished");
            JobReport::Finished { outcome }
        }
        Err(err) => {
            let cause = err.root_cause().to_string();
            tracing::error!(error = %err, cause = %cause, "PCQ disposer job failed: {err:#}");
            JobReport::Failed {
                error: err.to_string(),
                cause,
            }
        }
    }
}
