use crate::clock::now_ms;
use crate::executor::{step_is_stale, ExecutorSettings};
use crate::schema::{RunStatus, StepStatus};
use crate::store::{
    count_steps_with_status, find_run, first_step_with_status, list_active_run_ids,
    output_for_step, RunError,
};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    MissingRun,
    Terminal,
    CorruptRunningStep,
    RunningHasOutput,
    StaleRunning,
    AlreadyRunning,
    QueuedSteps,
    NoWork,
}

impl ResumeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRun => "missing_run",
            Self::Terminal => "terminal",
            Self::CorruptRunningStep => "corrupt_running_step",
            Self::RunningHasOutput => "running_has_output",
            Self::StaleRunning => "stale_running",
            Self::AlreadyRunning => "already_running",
            Self::QueuedSteps => "queued_steps",
            Self::NoWork => "no_work",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeDecision {
    pub enqueue: bool,
    pub run_id: i64,
    /// Run status at decision time, `unknown` when the run does not exist.
    pub status: String,
    pub reason: ResumeReason,
}

pub struct Resume;

impl Resume {
    /// Decides whether a run needs another job enqueued. Never mutates
    /// storage; the exclusive transaction only gives a consistent view and is
    /// rolled back on drop.
    pub fn call(
        connection: &mut Connection,
        run_id: i64,
        settings: &ExecutorSettings,
    ) -> Result<ResumeDecision, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let decision = decide(&tx, run_id, settings, now_ms())?;
        drop(tx);
        debug!(run_id, enqueue = decision.enqueue, reason = decision.reason.as_str(), "resume decided");
        Ok(decision)
    }
}

fn decide(
    connection: &Connection,
    run_id: i64,
    settings: &ExecutorSettings,
    now: i64,
) -> Result<ResumeDecision, RunError> {
    let Some(run) = find_run(connection, run_id)? else {
        return Ok(ResumeDecision {
            enqueue: false,
            run_id,
            status: "unknown".to_string(),
            reason: ResumeReason::MissingRun,
        });
    };
    let decision = |enqueue: bool, reason: ResumeReason| ResumeDecision {
        enqueue,
        run_id,
        status: run.status.as_str().to_string(),
        reason,
    };

    if run.status.is_terminal() {
        if run.status == RunStatus::Cancelled {
            if let Some(step) = first_step_with_status(connection, run_id, StepStatus::Running)? {
                let deferred = step.meta_str("enqueue_job_id").is_some();
                if !deferred && output_for_step(connection, step.id)?.is_some() {
                    return Ok(decision(true, ResumeReason::RunningHasOutput));
                }
            }
        }
        return Ok(decision(false, ResumeReason::Terminal));
    }

    if let Some(step) = first_step_with_status(connection, run_id, StepStatus::Running)? {
        let Some(started_at) = step.step_started_at_ms else {
            error!(run_id, step_id = step.id, agent = %step.agent_name, "running step is missing its start time");
            return Ok(decision(false, ResumeReason::CorruptRunningStep));
        };
        if step.meta_str("enqueue_job_id").is_some() {
            // Waiting on an external delivery; only its callback finishes it.
            return Ok(decision(false, ResumeReason::AlreadyRunning));
        }
        if output_for_step(connection, step.id)?.is_some() {
            return Ok(decision(true, ResumeReason::RunningHasOutput));
        }
        if step_is_stale(settings, &step, started_at, now) {
            return Ok(decision(true, ResumeReason::StaleRunning));
        }
        return Ok(decision(false, ResumeReason::AlreadyRunning));
    }

    if count_steps_with_status(connection, run_id, StepStatus::Queued)? > 0 {
        Ok(decision(true, ResumeReason::QueuedSteps))
    } else {
        Ok(decision(false, ResumeReason::NoWork))
    }
}

/// Evaluates every active run, oldest first, and returns all decisions.
/// Callers enqueue the ones with `enqueue == true`.
pub fn sweep(
    connection: &mut Connection,
    settings: &ExecutorSettings,
    limit: usize,
) -> Result<Vec<ResumeDecision>, RunError> {
    let run_ids = list_active_run_ids(connection, limit)?;
    let mut decisions = Vec::with_capacity(run_ids.len());
    for run_id in run_ids {
        decisions.push(Resume::call(connection, run_id, settings)?);
    }
    Ok(decisions)
}
