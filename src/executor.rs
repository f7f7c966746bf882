use crate::agents::{AgentError, AgentRegistry, AgentReply, AgentRequest};
use crate::clock::{now_ms, rfc3339_from_ms};
use crate::config_resolver::{ConfigResolver, ResolvedAgentConfig};
use crate::critique::{normalize_critique, parse_score, quality_from_critique};
use crate::db::get_lead;
use crate::planner::POSITION_GAP;
use crate::prompt_filter::PromptSettingsFilter;
use crate::schema::{AgentName, OutputStatus, RunStatus, StepStatus};
use crate::settings::{integer_setting, settings_from_value, MIN_SCORE_FOR_SEND};
use crate::store::{
    count_steps_with_status, first_step_with_status, get_output, get_run, get_step,
    insert_output, last_step_for_agent, output_for_step, record_activity, update_output,
    update_step_meta, OutputInsert, OutputRecord, RunError, RunRecord, StepMeta, StepRecord,
};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_STALE_STEP_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_SENDER_STALE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_STEP_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub stale_step_timeout: Duration,
    /// SENDER steps without a delivery handle get a longer grace period.
    pub sender_stale_timeout: Duration,
    /// Claims allowed per step before transient failures become permanent.
    pub max_step_attempts: i64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            stale_step_timeout: DEFAULT_STALE_STEP_TIMEOUT,
            sender_stale_timeout: DEFAULT_SENDER_STALE_TIMEOUT,
            max_step_attempts: DEFAULT_MAX_STEP_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed { step: StepRecord },
    AlreadyRunning { step_id: i64, agent_name: AgentName },
    Finalize { step_id: i64, agent_name: AgentName, output_id: i64 },
    StaleRecovered { step_id: i64, agent_name: AgentName, requeued: bool },
    BlockedWrongNextStep { requested: AgentName, next: AgentName },
    NoWork { run_status: RunStatus },
    RunTerminal { run_status: RunStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    StepCompleted,
    StepFailed,
    StepDeferred,
    RewriteQueued,
    TransientFailure,
    StaleRequeued,
    StaleTimedOut,
    AlreadyRunning,
    BlockedWrongNextStep,
    NoWork,
    RunTerminal,
    NoopStepAlreadyTerminal,
    NoopStepNotRunning,
}

impl CycleOutcome {
    fn allows_follow_up(&self) -> bool {
        !matches!(self, Self::TransientFailure | Self::BlockedWrongNextStep)
    }
}

/// Result of one claim/execute cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunNextResult {
    pub run_id: i64,
    pub outcome: CycleOutcome,
    pub step_id: Option<i64>,
    pub agent_name: Option<AgentName>,
    pub run_status: RunStatus,
    /// True when another cycle can start right away: the run is active,
    /// nothing is running and queued steps remain.
    pub continue_run: bool,
    pub detail: Option<String>,
}

enum StepDecision {
    Complete,
    Fail { code: String },
    Defer,
    Rewrite,
}

struct Finalized {
    outcome: CycleOutcome,
    detail: Option<String>,
}

/// Claims and executes lead run steps, one step per call.
///
/// Every queued→running transition happens inside a `BEGIN IMMEDIATE`
/// transaction, which holds the database write lock for the duration of the
/// claim. Two workers racing on the same run therefore serialize: the second
/// one sees the step already running and backs off.
pub struct LeadRunExecutor {
    agents: AgentRegistry,
    settings: ExecutorSettings,
}

impl LeadRunExecutor {
    pub fn new(agents: AgentRegistry, settings: ExecutorSettings) -> Self {
        Self { agents, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Decides what the next cycle for a run should do and, when a step is
    /// runnable, claims it.
    ///
    /// Inside one exclusive transaction this:
    /// 1. returns `RunTerminal` for finished or cancelled runs
    /// 2. hands back an already running step (`Finalize` when its output is
    ///    written, `AlreadyRunning` otherwise), repairing it first when stale
    /// 3. marks queued steps whose agent has since been disabled as skipped
    /// 4. claims the next queued step, freezing its settings snapshot
    ///
    /// A snapshot already present in the step metadata is never recomputed,
    /// so a step that is claimed again after a retry sees identical settings.
    pub fn claim_or_prepare_action(
        &self,
        connection: &mut Connection,
        run_id: i64,
        requested_agent: Option<AgentName>,
    ) -> Result<ClaimOutcome, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let outcome = self.claim_in_tx(&tx, run_id, requested_agent)?;
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        Ok(outcome)
    }

    /// Runs exactly one claim/execute cycle for the run.
    ///
    /// The agent is called outside any transaction. Its output is persisted
    /// with a race-safe insert and the step is then finalized in a second
    /// exclusive transaction, so a crash between the two leaves an output
    /// that the next cycle finalizes without calling the agent again.
    pub fn run_next(
        &self,
        connection: &mut Connection,
        run_id: i64,
        requested_agent: Option<AgentName>,
    ) -> Result<RunNextResult, RunError> {
        let claim = self.claim_or_prepare_action(connection, run_id, requested_agent)?;
        debug!(run_id, claim = claim_label(&claim), "claim evaluated");

        match claim {
            ClaimOutcome::Claimed { step } => self.execute_claimed(connection, step),
            ClaimOutcome::Finalize {
                step_id,
                agent_name,
                output_id,
            } => {
                let finalized = self.finalize_from_output(connection, run_id, step_id, output_id)?;
                cycle_result(connection, run_id, finalized.outcome, Some(step_id), Some(agent_name), finalized.detail)
            }
            ClaimOutcome::AlreadyRunning { step_id, agent_name } => cycle_result(
                connection,
                run_id,
                CycleOutcome::AlreadyRunning,
                Some(step_id),
                Some(agent_name),
                None,
            ),
            ClaimOutcome::StaleRecovered {
                step_id,
                agent_name,
                requeued,
            } => {
                let outcome = if requeued {
                    CycleOutcome::StaleRequeued
                } else {
                    CycleOutcome::StaleTimedOut
                };
                cycle_result(connection, run_id, outcome, Some(step_id), Some(agent_name), None)
            }
            ClaimOutcome::BlockedWrongNextStep { requested, next } => cycle_result(
                connection,
                run_id,
                CycleOutcome::BlockedWrongNextStep,
                None,
                Some(next),
                Some(format!("requested {requested} but next step is {next}")),
            ),
            ClaimOutcome::NoWork { .. } => {
                cycle_result(connection, run_id, CycleOutcome::NoWork, None, None, None)
            }
            ClaimOutcome::RunTerminal { .. } => {
                cycle_result(connection, run_id, CycleOutcome::RunTerminal, None, None, None)
            }
        }
    }

    /// Completes a step whose work was handed to an external system, using
    /// the outcome that system reported. `Err` carries the failure message.
    pub fn complete_deferred_step(
        &self,
        connection: &mut Connection,
        step_id: i64,
        delivery: Result<Value, String>,
    ) -> Result<RunNextResult, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let step = get_step(&tx, step_id)?;
        let run_id = step.lead_run_id;

        if step.status != StepStatus::Running {
            let outcome = if step.status.is_terminal() {
                CycleOutcome::NoopStepAlreadyTerminal
            } else {
                CycleOutcome::NoopStepNotRunning
            };
            tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
            return cycle_result(connection, run_id, outcome, Some(step_id), Some(step.agent_name), None);
        }

        let output = output_for_step(&tx, step_id)?.ok_or_else(|| {
            RunError::InvalidState(format!("deferred step {step_id} has no output"))
        })?;
        let now = now_ms();
        let (outcome, step_status, stage, detail) = match delivery {
            Ok(data) => {
                let merged = merge_objects(&output.output, &data, json!({"email_status": "sent"}));
                update_output(&tx, output.id, OutputStatus::Completed, &merged, None)?;
                (CycleOutcome::StepCompleted, StepStatus::Completed, "sent", None)
            }
            Err(message) => {
                let merged = merge_objects(
                    &output.output,
                    &json!({"error": "delivery_failed", "message": message}),
                    json!({"email_status": "failed"}),
                );
                update_output(&tx, output.id, OutputStatus::Failed, &merged, Some(&message))?;
                (CycleOutcome::StepFailed, StepStatus::Failed, "send_failed", Some(message))
            }
        };

        tx.execute(
            "UPDATE lead_run_steps
             SET status = ?1, step_finished_at_ms = ?2, agent_output_id = ?3, updated_at_ms = ?2
             WHERE id = ?4 AND status = 'running'",
            params![step_status.as_str(), now, output.id, step_id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
        let run = get_run(&tx, run_id)?;
        set_lead_stage(&tx, run.lead_id, stage, None)?;
        record_activity(
            &tx,
            run_id,
            Some(step_id),
            "deferred_step_finished",
            Some(StepStatus::Running.as_str()),
            Some(step_status.as_str()),
            detail.as_deref().unwrap_or("Delivery confirmed."),
        )?;
        let run_status = enforce_run_status(&tx, run_id)?;
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;

        info!(run_id, step_id, status = step_status.as_str(), run_status = run_status.as_str(), "deferred step finished");
        cycle_result(connection, run_id, outcome, Some(step_id), Some(step.agent_name), detail)
    }

    /// Re-derives the run status from its steps.
    pub fn recompute_run_status(&self, connection: &mut Connection, run_id: i64) -> Result<RunStatus, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let status = enforce_run_status(&tx, run_id)?;
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        Ok(status)
    }

    fn claim_in_tx(
        &self,
        tx: &Connection,
        run_id: i64,
        requested_agent: Option<AgentName>,
    ) -> Result<ClaimOutcome, RunError> {
        let run = get_run(tx, run_id)?;
        if run.status.is_terminal() {
            // A step that was in flight when the run was cancelled may still
            // have written its output; that step is finalized, nothing new is claimed.
            if run.status == RunStatus::Cancelled {
                if let Some(step) = first_step_with_status(tx, run_id, StepStatus::Running)? {
                    if let Some(output) = output_for_step(tx, step.id)? {
                        if step.meta_str("enqueue_job_id").is_none() {
                            return Ok(ClaimOutcome::Finalize {
                                step_id: step.id,
                                agent_name: step.agent_name,
                                output_id: output.id,
                            });
                        }
                    }
                }
            }
            return Ok(ClaimOutcome::RunTerminal {
                run_status: run.status,
            });
        }

        let now = now_ms();
        if let Some(step) = first_step_with_status(tx, run_id, StepStatus::Running)? {
            if step.meta_str("enqueue_job_id").is_some() {
                return Ok(ClaimOutcome::AlreadyRunning {
                    step_id: step.id,
                    agent_name: step.agent_name,
                });
            }
            let output = output_for_step(tx, step.id)?;
            if let Some(output) = output {
                return Ok(ClaimOutcome::Finalize {
                    step_id: step.id,
                    agent_name: step.agent_name,
                    output_id: output.id,
                });
            }
            match step.step_started_at_ms {
                None => {
                    error!(run_id, step_id = step.id, agent = %step.agent_name, "running step has no start time; leaving it for manual repair");
                }
                Some(started_at) if step_is_stale(&self.settings, &step, started_at, now) => {
                    return self.recover_stale_step(tx, &run, step, now);
                }
                Some(_) => {}
            }
            return Ok(ClaimOutcome::AlreadyRunning {
                step_id: step.id,
                agent_name: step.agent_name,
            });
        }

        while let Some(step) = first_step_with_status(tx, run_id, StepStatus::Queued)? {
            let resolved =
                ConfigResolver::load(tx, run.campaign_id, step.agent_name).map_err(RunError::Db)?;
            if !resolved.enabled {
                skip_disabled_step(tx, &step, &resolved, now)?;
                continue;
            }
            if let Some(requested) = requested_agent {
                if requested != step.agent_name {
                    info!(run_id, requested = %requested, next = %step.agent_name, "requested agent is not next");
                    return Ok(ClaimOutcome::BlockedWrongNextStep {
                        requested,
                        next: step.agent_name,
                    });
                }
            }
            return claim_step(tx, &run, step, resolved, now);
        }

        let run_status = enforce_run_status(tx, run_id)?;
        Ok(ClaimOutcome::NoWork { run_status })
    }

    fn recover_stale_step(
        &self,
        tx: &Connection,
        run: &RunRecord,
        step: StepRecord,
        now: i64,
    ) -> Result<ClaimOutcome, RunError> {
        let attempts = step.meta_i64("attempts").unwrap_or(1);
        let retryable = step.agent_name != AgentName::Sender && attempts < self.settings.max_step_attempts;

        if retryable {
            let mut meta = step.meta.clone();
            let recoveries = step.meta_i64("stale_recoveries").unwrap_or(0) + 1;
            meta.insert("stale_recoveries".into(), json!(recoveries));
            meta.insert("last_error".into(), json!("worker did not report back before the timeout"));
            requeue_running_step(tx, &step, &meta, now)?;
            record_activity(
                tx,
                run.id,
                Some(step.id),
                "stale_step_requeued",
                Some(StepStatus::Running.as_str()),
                Some(StepStatus::Queued.as_str()),
                &format!("{} step was stale and has been queued again.", step.agent_name),
            )?;
            warn!(run_id = run.id, step_id = step.id, agent = %step.agent_name, attempts, "stale step requeued");
            return Ok(ClaimOutcome::StaleRecovered {
                step_id: step.id,
                agent_name: step.agent_name,
                requeued: true,
            });
        }

        let body = json!({
            "error": "timeout",
            "message": "step did not finish before the stale timeout",
            "retryable": false,
        });
        let output = insert_output(
            tx,
            &OutputInsert {
                lead_id: run.lead_id,
                lead_run_id: run.id,
                lead_run_step_id: step.id,
                agent_name: step.agent_name,
                status: OutputStatus::Failed,
                output: &body,
                error_message: Some("timeout"),
            },
        )?;
        tx.execute(
            "UPDATE lead_run_steps
             SET status = 'failed', step_finished_at_ms = ?1, agent_output_id = ?2, updated_at_ms = ?1
             WHERE id = ?3 AND status = 'running'",
            params![now, output.id, step.id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
        record_activity(
            tx,
            run.id,
            Some(step.id),
            "stale_step_failed",
            Some(StepStatus::Running.as_str()),
            Some(StepStatus::Failed.as_str()),
            &format!("{} step timed out.", step.agent_name),
        )?;
        enforce_run_status(tx, run.id)?;
        warn!(run_id = run.id, step_id = step.id, agent = %step.agent_name, "stale step failed with timeout");
        Ok(ClaimOutcome::StaleRecovered {
            step_id: step.id,
            agent_name: step.agent_name,
            requeued: false,
        })
    }

    fn execute_claimed(&self, connection: &mut Connection, step: StepRecord) -> Result<RunNextResult, RunError> {
        let run_id = step.lead_run_id;
        if let Some(existing) = output_for_step(connection, step.id)? {
            let finalized = self.finalize_from_output(connection, run_id, step.id, existing.id)?;
            return cycle_result(connection, run_id, finalized.outcome, Some(step.id), Some(step.agent_name), finalized.detail);
        }

        let run = get_run(connection, run_id)?;
        let reply = match self.build_request(connection, &run, &step)? {
            Ok(request) => match self.agents.get(step.agent_name) {
                Some(agent) => agent.run(&request),
                None => Err(AgentError::permanent(
                    "agent_unavailable",
                    format!("no agent registered for {}", step.agent_name),
                )),
            },
            Err(err) => Err(err),
        };

        let output = match reply {
            Ok(AgentReply::Completed(data)) => {
                insert_step_output(connection, &run, &step, OutputStatus::Completed, &data, None)?
            }
            Ok(AgentReply::Deferred { handle, data }) => self.persist_deferred(connection, &run, &step, &handle, &data)?,
            Err(err) if err.is_transient() => {
                if self.release_for_retry(connection, &step, &err)? {
                    return cycle_result(
                        connection,
                        run_id,
                        CycleOutcome::TransientFailure,
                        Some(step.id),
                        Some(step.agent_name),
                        Some(err.message),
                    );
                }
                let body = json!({"error": err.code, "message": err.message, "retryable": true, "attempts_exhausted": true});
                insert_step_output(connection, &run, &step, OutputStatus::Failed, &body, Some(&err.message))?
            }
            Err(err) => {
                warn!(run_id, step_id = step.id, agent = %step.agent_name, code = %err.code, "agent failed permanently");
                let body = json!({"error": err.code, "message": err.message, "retryable": false});
                insert_step_output(connection, &run, &step, OutputStatus::Failed, &body, Some(&err.message))?
            }
        };

        let finalized = self.finalize_from_output(connection, run_id, step.id, output.id)?;
        cycle_result(connection, run_id, finalized.outcome, Some(step.id), Some(step.agent_name), finalized.detail)
    }

    fn build_request(
        &self,
        connection: &Connection,
        run: &RunRecord,
        step: &StepRecord,
    ) -> Result<Result<AgentRequest, AgentError>, RunError> {
        let lead = get_lead(connection, run.lead_id)
            .map_err(RunError::Db)?
            .ok_or(RunError::LeadNotFound(run.lead_id))?;
        let snapshot = settings_from_value(step.meta.get("settings_snapshot").cloned().unwrap_or(Value::Null));
        let settings = PromptSettingsFilter::filter(step.agent_name, &snapshot);

        let mut inputs = Map::new();
        match step.agent_name {
            AgentName::Search => {}
            AgentName::Writer => {
                insert_latest_output(connection, run.id, AgentName::Search, "search", &mut inputs)?;
                if let Some(critique_step_id) = step.meta_i64("critique_step_id") {
                    if let Some(critique) = output_for_step(connection, critique_step_id)? {
                        inputs.insert("previous_critique".into(), critique.output);
                    }
                }
            }
            AgentName::Critique => {
                let writer_output = match step.meta_i64("writer_step_id") {
                    Some(writer_step_id) => output_for_step(connection, writer_step_id)?,
                    None => None,
                };
                match writer_output {
                    Some(output) => {
                        inputs.insert("writer".into(), output.output);
                    }
                    None => insert_latest_output(connection, run.id, AgentName::Writer, "writer", &mut inputs)?,
                }
            }
            AgentName::Design => {
                insert_latest_output(connection, run.id, AgentName::Writer, "writer", &mut inputs)?;
                insert_latest_output(connection, run.id, AgentName::Critique, "critique", &mut inputs)?;
            }
            AgentName::Sender => {
                let source_agent = match step.meta_i64("source_step_id") {
                    Some(source_step_id) => Some(get_step(connection, source_step_id)?.agent_name),
                    None => None,
                };
                let Some(source_agent) = source_agent else {
                    return Ok(Err(AgentError::permanent(
                        "missing_send_source",
                        "send step has no source step",
                    )));
                };
                // Rewrites add newer WRITER steps, so the latest completed one wins.
                insert_latest_output(connection, run.id, source_agent, "source", &mut inputs)?;
                if !inputs.contains_key("source") {
                    return Ok(Err(AgentError::permanent(
                        "missing_send_source_output",
                        format!("no completed {source_agent} output to send"),
                    )));
                }
            }
        }

        Ok(Ok(AgentRequest {
            run_id: run.id,
            step_id: step.id,
            agent_name: step.agent_name,
            lead,
            settings,
            inputs,
        }))
    }

    fn persist_deferred(
        &self,
        connection: &mut Connection,
        run: &RunRecord,
        step: &StepRecord,
        handle: &str,
        data: &Value,
    ) -> Result<OutputRecord, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let now = now_ms();
        let body = merge_objects(data, &json!({"enqueue_job_id": handle}), json!({"email_status": "queued"}));
        let output = insert_step_output(&tx, run, step, OutputStatus::Pending, &body, None)?;

        let mut meta = get_step(&tx, step.id)?.meta;
        meta.insert("enqueue_job_id".into(), json!(handle));
        meta.insert("enqueued_at".into(), json!(rfc3339_from_ms(now)));
        update_step_meta(&tx, step.id, &meta)?;
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        info!(run_id = run.id, step_id = step.id, handle, "step handed off for external delivery");
        Ok(output)
    }

    /// Puts a step that hit a transient failure back in the queue. Returns
    /// false once the step has used up its attempts.
    fn release_for_retry(
        &self,
        connection: &mut Connection,
        step: &StepRecord,
        err: &AgentError,
    ) -> Result<bool, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let current = get_step(&tx, step.id)?;
        if current.status != StepStatus::Running {
            tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
            return Ok(true);
        }
        let attempts = current.meta_i64("attempts").unwrap_or(1);
        if attempts >= self.settings.max_step_attempts {
            tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
            warn!(run_id = step.lead_run_id, step_id = step.id, attempts, "transient failures exhausted step attempts");
            return Ok(false);
        }

        let mut meta = current.meta.clone();
        let failures = current.meta_i64("transient_failures").unwrap_or(0) + 1;
        meta.insert("transient_failures".into(), json!(failures));
        meta.insert("last_error".into(), json!(err.message));
        requeue_running_step(&tx, &current, &meta, now_ms())?;
        record_activity(
            &tx,
            step.lead_run_id,
            Some(step.id),
            "step_retry_scheduled",
            Some(StepStatus::Running.as_str()),
            Some(StepStatus::Queued.as_str()),
            &format!("{} hit a temporary error and will be retried.", step.agent_name),
        )?;
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        warn!(run_id = step.lead_run_id, step_id = step.id, agent = %step.agent_name, attempts, error = %err, "transient agent failure");
        Ok(true)
    }

    /// Moves a running step to its terminal state based on its output.
    /// Never rewrites a step that already finished.
    fn finalize_from_output(
        &self,
        connection: &mut Connection,
        run_id: i64,
        step_id: i64,
        output_id: i64,
    ) -> Result<Finalized, RunError> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;
        let step = get_step(&tx, step_id)?;
        if step.status.is_terminal() {
            tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
            return Ok(Finalized {
                outcome: CycleOutcome::NoopStepAlreadyTerminal,
                detail: None,
            });
        }
        if step.status != StepStatus::Running {
            tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
            return Ok(Finalized {
                outcome: CycleOutcome::NoopStepNotRunning,
                detail: None,
            });
        }

        let output = get_output(&tx, output_id)?
            .ok_or_else(|| RunError::InvalidState(format!("output {output_id} missing for step {step_id}")))?;
        let run = get_run(&tx, run_id)?;
        let decision = match step.agent_name {
            AgentName::Critique => decide_critique(&tx, &run, &step, &output)?,
            _ => match output.status {
                OutputStatus::Completed
                    if step.agent_name == AgentName::Sender
                        && output.output.get("delivered") == Some(&Value::Bool(false)) =>
                {
                    StepDecision::Fail {
                        code: "not_delivered".to_string(),
                    }
                }
                OutputStatus::Completed => StepDecision::Complete,
                OutputStatus::Pending if step.agent_name == AgentName::Sender => StepDecision::Defer,
                OutputStatus::Pending => StepDecision::Fail {
                    code: "unexpected_pending_output".to_string(),
                },
                OutputStatus::Failed => StepDecision::Fail {
                    code: failure_code(&output.output),
                },
            },
        };

        let now = now_ms();
        let (outcome, detail) = match decision {
            StepDecision::Complete => {
                finish_step(&tx, &step, StepStatus::Completed, output.id, now)?;
                project_lead_stage(&tx, &run, &step, &output)?;
                (CycleOutcome::StepCompleted, None)
            }
            StepDecision::Rewrite => {
                finish_step(&tx, &step, StepStatus::Completed, output.id, now)?;
                insert_rewrite_steps(&tx, &run, &step, now)?;
                project_lead_stage(&tx, &run, &step, &output)?;
                (CycleOutcome::RewriteQueued, None)
            }
            StepDecision::Fail { code } => {
                finish_step(&tx, &step, StepStatus::Failed, output.id, now)?;
                if step.agent_name == AgentName::Sender {
                    set_lead_stage(&tx, run.lead_id, "send_failed", None)?;
                }
                warn!(run_id, step_id, agent = %step.agent_name, code = %code, "step failed");
                (CycleOutcome::StepFailed, Some(code))
            }
            StepDecision::Defer => {
                tx.execute(
                    "UPDATE lead_run_steps SET agent_output_id = ?1, updated_at_ms = ?2 WHERE id = ?3",
                    params![output.id, now, step.id],
                )
                .map_err(|e| RunError::Db(e.to_string()))?;
                set_lead_stage(&tx, run.lead_id, "sending", None)?;
                (CycleOutcome::StepDeferred, None)
            }
        };

        let run_status = enforce_run_status(&tx, run_id)?;
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        info!(
            run_id,
            step_id,
            agent = %step.agent_name,
            outcome = ?outcome,
            run_status = run_status.as_str(),
            "step finalized"
        );
        Ok(Finalized { outcome, detail })
    }
}

/// A running step is stale once it has been running longer than its
/// timeout. SENDER steps waiting on an external delivery are never stale.
pub(crate) fn step_is_stale(settings: &ExecutorSettings, step: &StepRecord, started_at_ms: i64, now: i64) -> bool {
    if step.meta_str("enqueue_job_id").is_some() {
        return false;
    }
    let timeout = if step.agent_name == AgentName::Sender {
        settings.sender_stale_timeout
    } else {
        settings.stale_step_timeout
    };
    now.saturating_sub(started_at_ms) > timeout.as_millis() as i64
}

fn claim_label(claim: &ClaimOutcome) -> &'static str {
    match claim {
        ClaimOutcome::Claimed { .. } => "claimed",
        ClaimOutcome::AlreadyRunning { .. } => "already_running",
        ClaimOutcome::Finalize { .. } => "finalize",
        ClaimOutcome::StaleRecovered { .. } => "stale_recovered",
        ClaimOutcome::BlockedWrongNextStep { .. } => "blocked_wrong_next_step",
        ClaimOutcome::NoWork { .. } => "no_work",
        ClaimOutcome::RunTerminal { .. } => "run_terminal",
    }
}

fn claim_step(
    tx: &Connection,
    run: &RunRecord,
    step: StepRecord,
    resolved: ResolvedAgentConfig,
    now: i64,
) -> Result<ClaimOutcome, RunError> {
    let mut meta = step.meta.clone();
    if !meta.contains_key("settings_snapshot") {
        meta.insert(
            "settings_snapshot".into(),
            Value::Object(resolved.settings_snapshot),
        );
        meta.insert("settings_snapshot_at".into(), json!(rfc3339_from_ms(now)));
        meta.insert("config_id".into(), json!(resolved.config_id));
        meta.insert("config_updated_at".into(), json!(resolved.config_updated_at));
    }
    let attempts = step.meta_i64("attempts").unwrap_or(0) + 1;
    meta.insert("attempts".into(), json!(attempts));
    let meta_json = serde_json::to_string(&meta).map_err(|e| RunError::Serde(e.to_string()))?;

    let changed = tx
        .execute(
            "UPDATE lead_run_steps
             SET status = 'running', step_started_at_ms = ?1, step_finished_at_ms = NULL,
                 meta_json = ?2, updated_at_ms = ?1
             WHERE id = ?3 AND status = 'queued'",
            params![now, meta_json, step.id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    if changed != 1 {
        return Err(RunError::InvalidState(format!("step {} was not queued", step.id)));
    }

    tx.execute(
        "UPDATE lead_runs
         SET status = 'running', started_at_ms = COALESCE(started_at_ms, ?1), updated_at_ms = ?1
         WHERE id = ?2 AND status IN ('queued', 'running')",
        params![now, run.id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    if run.status == RunStatus::Queued {
        record_activity(
            tx,
            run.id,
            Some(step.id),
            "run_started",
            Some(RunStatus::Queued.as_str()),
            Some(RunStatus::Running.as_str()),
            "Run started.",
        )?;
    }

    info!(run_id = run.id, step_id = step.id, agent = %step.agent_name, attempts, "step claimed");
    Ok(ClaimOutcome::Claimed {
        step: get_step(tx, step.id)?,
    })
}

fn skip_disabled_step(
    tx: &Connection,
    step: &StepRecord,
    resolved: &ResolvedAgentConfig,
    now: i64,
) -> Result<(), RunError> {
    let mut meta = step.meta.clone();
    meta.insert("skip_reason".into(), json!("agent_disabled"));
    meta.insert("skipped_at".into(), json!(rfc3339_from_ms(now)));
    meta.insert("skipped_agent_name".into(), json!(step.agent_name.as_str()));
    meta.insert("config_id".into(), json!(resolved.config_id));
    meta.insert("config_updated_at".into(), json!(resolved.config_updated_at));
    let meta_json = serde_json::to_string(&meta).map_err(|e| RunError::Serde(e.to_string()))?;

    tx.execute(
        "UPDATE lead_run_steps
         SET status = 'skipped', step_finished_at_ms = ?1, meta_json = ?2, updated_at_ms = ?1
         WHERE id = ?3 AND status = 'queued'",
        params![now, meta_json, step.id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    record_activity(
        tx,
        step.lead_run_id,
        Some(step.id),
        "step_skipped",
        Some(StepStatus::Queued.as_str()),
        Some(StepStatus::Skipped.as_str()),
        &format!("{} is disabled; step skipped.", step.agent_name),
    )?;
    info!(run_id = step.lead_run_id, step_id = step.id, agent = %step.agent_name, "skipped step for disabled agent");
    Ok(())
}

fn requeue_running_step(tx: &Connection, step: &StepRecord, meta: &StepMeta, now: i64) -> Result<(), RunError> {
    let meta_json = serde_json::to_string(meta).map_err(|e| RunError::Serde(e.to_string()))?;
    tx.execute(
        "UPDATE lead_run_steps
         SET status = 'queued', step_started_at_ms = NULL, meta_json = ?1, updated_at_ms = ?2
         WHERE id = ?3 AND status = 'running'",
        params![meta_json, now, step.id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(())
}

fn finish_step(tx: &Connection, step: &StepRecord, status: StepStatus, output_id: i64, now: i64) -> Result<(), RunError> {
    tx.execute(
        "UPDATE lead_run_steps
         SET status = ?1, agent_output_id = ?2, step_finished_at_ms = ?3, updated_at_ms = ?3
         WHERE id = ?4 AND status = 'running'",
        params![status.as_str(), output_id, now, step.id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    record_activity(
        tx,
        step.lead_run_id,
        Some(step.id),
        "step_finished",
        Some(StepStatus::Running.as_str()),
        Some(status.as_str()),
        &format!("{} step {}.", step.agent_name, status.as_str()),
    )
}

fn insert_step_output(
    connection: &Connection,
    run: &RunRecord,
    step: &StepRecord,
    status: OutputStatus,
    body: &Value,
    error_message: Option<&str>,
) -> Result<OutputRecord, RunError> {
    insert_output(
        connection,
        &OutputInsert {
            lead_id: run.lead_id,
            lead_run_id: run.id,
            lead_run_step_id: step.id,
            agent_name: step.agent_name,
            status,
            output: body,
            error_message,
        },
    )
}

fn insert_latest_output(
    connection: &Connection,
    run_id: i64,
    agent: AgentName,
    key: &str,
    inputs: &mut Map<String, Value>,
) -> Result<(), RunError> {
    if let Some(step) = last_step_for_agent(connection, run_id, agent, StepStatus::Completed)? {
        if let Some(output) = output_for_step(connection, step.id)? {
            inputs.insert(key.to_string(), output.output);
        }
    }
    Ok(())
}

fn decide_critique(
    tx: &Connection,
    run: &RunRecord,
    step: &StepRecord,
    output: &OutputRecord,
) -> Result<StepDecision, RunError> {
    if output.status == OutputStatus::Failed {
        return Ok(StepDecision::Fail {
            code: failure_code(&output.output),
        });
    }

    let raw = output.output.clone();
    let Some(score) = raw.get("score").and_then(parse_score) else {
        let body = merge_objects(&raw, &json!({"error": "score_parse_failed"}), Value::Null);
        update_output(tx, output.id, OutputStatus::Failed, &body, Some("score_parse_failed"))?;
        warn!(run_id = run.id, step_id = step.id, "critique score could not be parsed");
        return Ok(StepDecision::Fail {
            code: "score_parse_failed".to_string(),
        });
    };

    let snapshot = settings_from_value(step.meta.get("settings_snapshot").cloned().unwrap_or(Value::Null));
    let (threshold, source, pointer) = match integer_setting(&snapshot, MIN_SCORE_FOR_SEND) {
        Some(value) => (
            value.clamp(0, 10),
            "step_settings_snapshot",
            "lead_run_steps.meta.settings_snapshot.min_score_for_send",
        ),
        None => (run.min_score, "run_min_score", "lead_runs.min_score"),
    };
    let meets = score >= threshold;
    let critique_text = raw.get("critique").and_then(Value::as_str);

    let normalized = merge_objects(
        &raw,
        &json!({
            "score": score,
            "meets_min_score": meets,
            "raw_meets_min_score": raw.get("meets_min_score").cloned().unwrap_or(Value::Null),
            "threshold_used": threshold,
            "threshold_source": source,
            "threshold_source_pointer": pointer,
            "critique": normalize_critique(critique_text),
            "config_id": step.meta.get("config_id").cloned().unwrap_or(Value::Null),
            "config_updated_at": step.meta.get("config_updated_at").cloned().unwrap_or(Value::Null),
        }),
        Value::Null,
    );

    if meets || run.status == RunStatus::Cancelled {
        update_output(tx, output.id, OutputStatus::Completed, &normalized, None)?;
        return Ok(StepDecision::Complete);
    }

    if run.rewrite_count < run.max_rewrites {
        update_output(tx, output.id, OutputStatus::Completed, &normalized, None)?;
        return Ok(StepDecision::Rewrite);
    }

    let mut failed = normalized;
    if let Some(fields) = failed.as_object_mut() {
        fields.insert("error".into(), json!("min_score_not_met"));
    }
    update_output(tx, output.id, OutputStatus::Failed, &failed, Some("min_score_not_met"))?;
    info!(
        run_id = run.id,
        step_id = step.id,
        score,
        threshold,
        rewrites = run.rewrite_count,
        "critique below threshold with rewrites exhausted"
    );
    Ok(StepDecision::Fail {
        code: "min_score_not_met".to_string(),
    })
}

/// Queues a WRITER and a follow-up CRITIQUE right after a failing critique
/// and bumps the run's rewrite count. Does nothing if this critique already
/// produced a rewrite.
fn insert_rewrite_steps(tx: &Connection, run: &RunRecord, critique: &StepRecord, now: i64) -> Result<bool, RunError> {
    let existing: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM lead_run_steps
             WHERE lead_run_id = ?1 AND agent_name = 'WRITER'
               AND json_extract(meta_json, '$.critique_step_id') = ?2",
            params![run.id, critique.id],
            |row| row.get(0),
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    if existing > 0 {
        return Ok(false);
    }

    let bumped = tx
        .execute(
            "UPDATE lead_runs SET rewrite_count = rewrite_count + 1, updated_at_ms = ?1
             WHERE id = ?2 AND rewrite_count < max_rewrites",
            params![now, run.id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    if bumped != 1 {
        return Ok(false);
    }

    let revision = run.rewrite_count + 1;
    let (writer_position, critique_position) = allocate_positions_after(tx, run.id, critique.id)?;

    let writer_meta = json!({"revision": revision, "critique_step_id": critique.id});
    let writer_id = insert_queued_step(tx, run.id, writer_position, AgentName::Writer, &writer_meta, now)?;
    let critique_meta = json!({
        "revision": revision,
        "writer_step_id": writer_id,
        "selected_variant_index": 0,
    });
    insert_queued_step(tx, run.id, critique_position, AgentName::Critique, &critique_meta, now)?;

    record_activity(
        tx,
        run.id,
        Some(critique.id),
        "rewrite_queued",
        None,
        None,
        &format!("Critique below threshold; rewrite {revision} of {} queued.", run.max_rewrites),
    )?;
    info!(run_id = run.id, critique_step_id = critique.id, revision, "rewrite queued");
    Ok(true)
}

fn insert_queued_step(
    tx: &Connection,
    run_id: i64,
    position: i64,
    agent: AgentName,
    meta: &Value,
    now: i64,
) -> Result<i64, RunError> {
    tx.execute(
        "
        INSERT INTO lead_run_steps (
          lead_run_id, position, agent_name, status, meta_json, created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?5)
        ",
        params![run_id, position, agent.as_str(), meta.to_string(), now],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(tx.last_insert_rowid())
}

/// Finds two free positions directly after `after_step_id`, renumbering the
/// run's steps to 10, 20, 30… first if the gap is too small.
fn allocate_positions_after(tx: &Connection, run_id: i64, after_step_id: i64) -> Result<(i64, i64), RunError> {
    for _ in 0..2 {
        let after = get_step(tx, after_step_id)?.position;
        let next: Option<i64> = tx
            .query_row(
                "SELECT MIN(position) FROM lead_run_steps WHERE lead_run_id = ?1 AND position > ?2",
                params![run_id, after],
                |row| row.get(0),
            )
            .map_err(|e| RunError::Db(e.to_string()))?;
        match next {
            None => return Ok((after + POSITION_GAP, after + 2 * POSITION_GAP)),
            Some(next) if next - after >= 3 => {
                let gap = (next - after) / 3;
                return Ok((after + gap, after + 2 * gap));
            }
            Some(_) => renumber_positions(tx, run_id)?,
        }
    }
    Err(RunError::InvalidState(format!("no room for rewrite steps in run {run_id}")))
}

fn renumber_positions(tx: &Connection, run_id: i64) -> Result<(), RunError> {
    let ids: Vec<i64> = {
        let mut stmt = tx
            .prepare("SELECT id FROM lead_run_steps WHERE lead_run_id = ?1 ORDER BY position ASC")
            .map_err(|e| RunError::Db(e.to_string()))?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, i64>(0))
            .map_err(|e| RunError::Db(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| RunError::Db(e.to_string()))?
    };
    // Move everything out of the way first so the unique (run, position)
    // index never sees a collision.
    tx.execute(
        "UPDATE lead_run_steps SET position = -position - 1 WHERE lead_run_id = ?1",
        params![run_id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    for (index, id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE lead_run_steps SET position = ?1 WHERE id = ?2",
            params![(index as i64 + 1) * POSITION_GAP, id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    }
    debug!(run_id, steps = ids.len(), "step positions renumbered");
    Ok(())
}

/// Derives the run status from its steps. Cancelled is sticky; any failed
/// step fails the run; no queued or running steps completes it.
pub(crate) fn enforce_run_status(tx: &Connection, run_id: i64) -> Result<RunStatus, RunError> {
    let run = get_run(tx, run_id)?;
    if run.status == RunStatus::Cancelled {
        return Ok(run.status);
    }

    let failed = count_steps_with_status(tx, run_id, StepStatus::Failed)?;
    let open = count_steps_with_status(tx, run_id, StepStatus::Queued)?
        + count_steps_with_status(tx, run_id, StepStatus::Running)?;
    let next_status = if failed > 0 {
        RunStatus::Failed
    } else if open == 0 {
        RunStatus::Completed
    } else if run.started_at_ms.is_some() {
        RunStatus::Running
    } else {
        run.status
    };

    if next_status == run.status {
        return Ok(next_status);
    }

    let now = now_ms();
    tx.execute(
        "UPDATE lead_runs
         SET status = ?1,
             finished_at_ms = CASE WHEN ?2 THEN COALESCE(finished_at_ms, ?3) ELSE finished_at_ms END,
             updated_at_ms = ?3
         WHERE id = ?4",
        params![next_status.as_str(), next_status.is_terminal(), now, run_id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    record_activity(
        tx,
        run_id,
        None,
        "run_status_changed",
        Some(run.status.as_str()),
        Some(next_status.as_str()),
        &format!("Run is now {}.", next_status.as_str()),
    )?;
    if next_status.is_terminal() {
        release_lead_pointer(tx, run.lead_id, run_id)?;
        info!(run_id, status = next_status.as_str(), "run finished");
    }
    Ok(next_status)
}

pub(crate) fn release_lead_pointer(tx: &Connection, lead_id: i64, run_id: i64) -> Result<(), RunError> {
    tx.execute(
        "UPDATE leads SET current_lead_run_id = NULL, updated_at_ms = ?1
         WHERE id = ?2 AND current_lead_run_id = ?3",
        params![now_ms(), lead_id, run_id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(())
}

fn project_lead_stage(tx: &Connection, run: &RunRecord, step: &StepRecord, output: &OutputRecord) -> Result<(), RunError> {
    match step.agent_name {
        AgentName::Search => set_lead_stage(tx, run.lead_id, "searched", None),
        AgentName::Writer => match step.meta_i64("revision") {
            Some(revision) if revision > 0 => {
                set_lead_stage(tx, run.lead_id, &format!("rewritten ({revision})"), None)
            }
            _ => set_lead_stage(tx, run.lead_id, "written", None),
        },
        AgentName::Critique => {
            // Reads the stored row so the normalized critique is used.
            let critique = get_output(tx, output.id)?
                .and_then(|stored| stored.output.get("critique").and_then(Value::as_str).map(str::to_string));
            set_lead_stage(
                tx,
                run.lead_id,
                "critiqued",
                Some(quality_from_critique(critique.as_deref())),
            )
        }
        AgentName::Design => set_lead_stage(tx, run.lead_id, "designed", None),
        AgentName::Sender => set_lead_stage(tx, run.lead_id, "sent", None),
    }
}

fn set_lead_stage(tx: &Connection, lead_id: i64, stage: &str, quality: Option<&str>) -> Result<(), RunError> {
    tx.execute(
        "UPDATE leads SET stage = ?1, quality = COALESCE(?2, quality), updated_at_ms = ?3 WHERE id = ?4",
        params![stage, quality, now_ms(), lead_id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(())
}

fn failure_code(output: &Value) -> String {
    output
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("agent_failed")
        .to_string()
}

/// Shallow merge of JSON objects: `base`, then `overlay`, then `extra`.
/// Non-object values are ignored.
fn merge_objects(base: &Value, overlay: &Value, extra: Value) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    for source in [overlay, &extra] {
        if let Value::Object(map) = source {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

fn cycle_result(
    connection: &Connection,
    run_id: i64,
    outcome: CycleOutcome,
    step_id: Option<i64>,
    agent_name: Option<AgentName>,
    detail: Option<String>,
) -> Result<RunNextResult, RunError> {
    let run = get_run(connection, run_id)?;
    let continue_run = outcome.allows_follow_up()
        && run.status.is_active()
        && count_steps_with_status(connection, run_id, StepStatus::Running)? == 0
        && count_steps_with_status(connection, run_id, StepStatus::Queued)? > 0;
    Ok(RunNextResult {
        run_id,
        outcome,
        step_id,
        agent_name,
        run_status: run.status,
        continue_run,
        detail,
    })
}
