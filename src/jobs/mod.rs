mod queue;
mod runtime;

pub use queue::{InMemoryJobQueue, JobEnvelope, JobQueue};
pub use runtime::{Disposition, RetryPolicy, WorkerPool};

use crate::executor::{CycleOutcome, LeadRunExecutor, RunNextResult};
use crate::pause::PauseGate;
use crate::resume::ResumeDecision;
use crate::schema::AgentName;
use crate::store::RunError;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job arguments: {0}")]
    Argument(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("agent error: {0}")]
    Agent(String),
}

impl JobError {
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::Argument(_))
    }
}

impl From<RunError> for JobError {
    fn from(error: RunError) -> Self {
        match error {
            RunError::RunNotFound(_) => Self::Argument(error.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Wire shape of a lead run job. Only keyword form is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeadRunJobPayload {
    pub run_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_agent_name: Option<String>,
}

impl LeadRunJobPayload {
    pub fn new(run_id: i64, requested_agent: Option<AgentName>) -> Self {
        Self {
            run_id,
            requested_agent_name: requested_agent.map(|agent| agent.as_str().to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Validates a raw payload. Positional arrays from older enqueuers and
    /// unknown keys are rejected.
    pub fn parse(raw: &Value) -> Result<(i64, Option<AgentName>), JobError> {
        if !raw.is_object() {
            return Err(JobError::Argument(format!(
                "payload must be an object with run_id, got {}",
                json_kind(raw)
            )));
        }
        let payload: Self = serde_json::from_value(raw.clone())
            .map_err(|e| JobError::Argument(e.to_string()))?;
        if payload.run_id <= 0 {
            return Err(JobError::Argument(format!(
                "run_id must be positive, got {}",
                payload.run_id
            )));
        }
        let agent = payload
            .requested_agent_name
            .as_deref()
            .map(AgentName::from_str)
            .transpose()
            .map_err(|e| JobError::Argument(e.to_string()))?;
        Ok((payload.run_id, agent))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueKind {
    Paused,
}

/// What the job body asks the runtime to do next.
#[derive(Debug, Clone)]
pub enum JobDirective {
    Done(RunNextResult),
    Requeue { delay: Duration, kind: RequeueKind },
    Fail { reason: String, retryable: bool },
}

/// Job entry point: one claim/execute cycle per invocation.
pub struct LeadRunJob {
    executor: Arc<LeadRunExecutor>,
    pause: Arc<dyn PauseGate>,
    paused_interval: Duration,
}

impl LeadRunJob {
    pub fn new(executor: Arc<LeadRunExecutor>, pause: Arc<dyn PauseGate>, paused_interval: Duration) -> Self {
        Self {
            executor,
            pause,
            paused_interval,
        }
    }

    pub fn perform(&self, connection: &mut Connection, payload: &Value) -> JobDirective {
        match self.try_perform(connection, payload) {
            Ok(directive) => directive,
            Err(err) => {
                let retryable = err.retryable();
                if retryable {
                    warn!(error = %err, "lead run job failed");
                } else {
                    warn!(error = %err, payload = %payload, "lead run job rejected");
                }
                JobDirective::Fail {
                    reason: err.to_string(),
                    retryable,
                }
            }
        }
    }

    fn try_perform(&self, connection: &mut Connection, payload: &Value) -> Result<JobDirective, JobError> {
        let (run_id, requested_agent) = LeadRunJobPayload::parse(payload)?;

        if self.pause.is_paused() {
            info!(run_id, "execution paused; job requeued");
            return Ok(JobDirective::Requeue {
                delay: self.paused_interval,
                kind: RequeueKind::Paused,
            });
        }

        let result = self.executor.run_next(connection, run_id, requested_agent)?;
        if result.outcome == CycleOutcome::TransientFailure {
            return Err(JobError::Agent(
                result
                    .detail
                    .unwrap_or_else(|| "transient agent failure".to_string()),
            ));
        }
        Ok(JobDirective::Done(result))
    }
}

/// Enqueues a job for each decision that asks for one, skipping runs that
/// already have a job waiting. Returns how many jobs were enqueued.
pub fn enqueue_resumed(queue: &dyn JobQueue, decisions: &[ResumeDecision]) -> usize {
    let mut enqueued = 0;
    for decision in decisions.iter().filter(|decision| decision.enqueue) {
        let run_id = decision.run_id;
        if queue.any_pending(&|payload| payload.get("run_id").and_then(Value::as_i64) == Some(run_id)) {
            debug!(run_id, reason = decision.reason.as_str(), "run already has a waiting job");
            continue;
        }
        queue.enqueue(LeadRunJobPayload::new(run_id, None).to_value(), Duration::ZERO);
        enqueued += 1;
    }
    enqueued
}

#[cfg(test)]
mod tests {
    use super::{enqueue_resumed, InMemoryJobQueue, JobDirective, JobQueue, LeadRunJob, LeadRunJobPayload, RequeueKind};
    use crate::agents::{AgentError, AgentRegistry, ScriptedAgent};
    use crate::db::{bootstrap_schema, insert_campaign, insert_lead, LeadInsert};
    use crate::executor::{CycleOutcome, ExecutorSettings, LeadRunExecutor};
    use crate::pause::PauseSwitch;
    use crate::planner::LeadRunPlanner;
    use crate::resume::{ResumeDecision, ResumeReason};
    use crate::schema::{AgentName, StepStatus};
    use crate::settings::Settings;
    use crate::store::list_steps;
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    fn seed_run(conn: &mut Connection) -> i64 {
        let campaign_id = insert_campaign(conn, "Spring", &Settings::new()).expect("campaign");
        let lead_id = insert_lead(conn, &LeadInsert { campaign_id, ..LeadInsert::default() }).expect("lead");
        LeadRunPlanner::build(conn, lead_id).expect("plan").id
    }

    fn job(registry: AgentRegistry, pause: &PauseSwitch) -> LeadRunJob {
        LeadRunJob::new(
            Arc::new(LeadRunExecutor::new(registry, ExecutorSettings::default())),
            Arc::new(pause.clone()),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn payload_accepts_keyword_form() {
        assert_eq!(
            LeadRunJobPayload::parse(&json!({"run_id": 7, "requested_agent_name": "writer"})).expect("parse"),
            (7, Some(AgentName::Writer))
        );
        assert_eq!(LeadRunJobPayload::parse(&json!({"run_id": 7})).expect("parse"), (7, None));
        assert_eq!(
            LeadRunJobPayload::new(7, Some(AgentName::Critique)).to_value(),
            json!({"run_id": 7, "requested_agent_name": "CRITIQUE"})
        );
    }

    #[test]
    fn payload_rejects_legacy_and_malformed_shapes() {
        for raw in [
            json!([7, "WRITER"]),
            json!(7),
            json!({"run_id": 7, "lead_id": 3}),
            json!({"run_id": 0}),
            json!({"run_id": "7"}),
            json!({"run_id": 7, "requested_agent_name": "PUBLISHER"}),
        ] {
            let err = LeadRunJobPayload::parse(&raw).expect_err("should reject");
            assert!(!err.retryable(), "{raw} should not be retryable");
        }
    }

    #[test]
    fn paused_job_requeues_without_touching_the_run() {
        let mut conn = setup_conn();
        let run_id = seed_run(&mut conn);
        let pause = PauseSwitch::new(true);
        let job = job(AgentRegistry::dry_run(), &pause);

        match job.perform(&mut conn, &json!({"run_id": run_id})) {
            JobDirective::Requeue { delay, kind } => {
                assert_eq!(delay, Duration::from_secs(300));
                assert_eq!(kind, RequeueKind::Paused);
            }
            other => panic!("unexpected directive: {other:?}"),
        }
        assert!(list_steps(&conn, run_id)
            .expect("steps")
            .iter()
            .all(|step| step.status == StepStatus::Queued));
    }

    #[test]
    fn legacy_payload_is_discarded_even_while_paused() {
        let mut conn = setup_conn();
        let job = job(AgentRegistry::dry_run(), &PauseSwitch::new(true));
        match job.perform(&mut conn, &json!([1])) {
            JobDirective::Fail { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected directive: {other:?}"),
        }
    }

    #[test]
    fn unpaused_job_runs_exactly_one_cycle() {
        let mut conn = setup_conn();
        let run_id = seed_run(&mut conn);
        let job = job(AgentRegistry::dry_run(), &PauseSwitch::default());

        match job.perform(&mut conn, &json!({"run_id": run_id})) {
            JobDirective::Done(result) => {
                assert_eq!(result.outcome, CycleOutcome::StepCompleted);
                assert_eq!(result.agent_name, Some(AgentName::Search));
                assert!(result.continue_run);
            }
            other => panic!("unexpected directive: {other:?}"),
        }
        let statuses: Vec<StepStatus> = list_steps(&conn, run_id)
            .expect("steps")
            .into_iter()
            .map(|step| step.status)
            .collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Completed, StepStatus::Queued, StepStatus::Queued, StepStatus::Queued]
        );
    }

    #[test]
    fn transient_agent_failure_asks_for_a_retry() {
        let mut conn = setup_conn();
        let run_id = seed_run(&mut conn);
        let searcher = Arc::new(ScriptedAgent::new(vec![Err(AgentError::transient("rate limited"))]));
        let job = job(
            AgentRegistry::dry_run().with(AgentName::Search, searcher),
            &PauseSwitch::default(),
        );

        match job.perform(&mut conn, &json!({"run_id": run_id})) {
            JobDirective::Fail { reason, retryable } => {
                assert!(retryable);
                assert!(reason.contains("rate limited"));
            }
            other => panic!("unexpected directive: {other:?}"),
        }
    }

    #[test]
    fn missing_run_is_not_retried() {
        let mut conn = setup_conn();
        let job = job(AgentRegistry::dry_run(), &PauseSwitch::default());
        match job.perform(&mut conn, &json!({"run_id": 999})) {
            JobDirective::Fail { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected directive: {other:?}"),
        }
    }

    #[test]
    fn resumed_runs_are_enqueued_once() {
        let decision = |run_id: i64, enqueue: bool| ResumeDecision {
            enqueue,
            run_id,
            status: "running".to_string(),
            reason: if enqueue { ResumeReason::QueuedSteps } else { ResumeReason::AlreadyRunning },
        };
        let queue = InMemoryJobQueue::new();
        queue.enqueue(LeadRunJobPayload::new(1, None).to_value(), Duration::from_secs(30));

        let decisions = [decision(1, true), decision(2, true), decision(3, false)];
        assert_eq!(enqueue_resumed(&queue, &decisions), 1);
        assert_eq!(queue.len(), 2);

        assert_eq!(enqueue_resumed(&queue, &decisions), 0);
        assert_eq!(queue.len(), 2);
    }
}
