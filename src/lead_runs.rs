use crate::clock::now_ms;
use crate::config_resolver::ConfigResolver;
use crate::db::{get_campaign, get_lead};
use crate::executor::{release_lead_pointer, ExecutorSettings};
use crate::jobs::{JobQueue, LeadRunJobPayload};
use crate::pause::PauseGate;
use crate::planner::LeadRunPlanner;
use crate::resume::{Resume, ResumeDecision};
use crate::schema::{AgentName, RunStatus, StepStatus};
use crate::store::{find_active_run_for_lead, get_run, list_steps, record_activity, RunError, RunRecord, StepRecord};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

const SENT_STAGE_PREFIX: &str = "sent";

/// Returns the lead's active run, planning one if there is none. A run
/// created concurrently by another caller is picked up instead of failing.
pub fn ensure_active_run(connection: &mut Connection, lead_id: i64) -> Result<RunRecord, RunError> {
    if let Some(run) = find_active_run_for_lead(connection, lead_id)? {
        return Ok(run);
    }
    match LeadRunPlanner::build(connection, lead_id) {
        Ok(run) => Ok(run),
        Err(RunError::ActiveRunExists { .. }) => find_active_run_for_lead(connection, lead_id)?
            .ok_or_else(|| RunError::InvalidState(format!("active run for lead {lead_id} vanished"))),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub id: Option<i64>,
    pub agent_name: AgentName,
}

impl From<&StepRecord> for StepSummary {
    fn from(step: &StepRecord) -> Self {
        Self {
            id: Some(step.id),
            agent_name: step.agent_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadRunStatus {
    pub run_id: Option<i64>,
    pub run_status: String,
    pub running_step: Option<StepSummary>,
    pub last_completed_step: Option<StepSummary>,
    pub next_step: Option<StepSummary>,
    pub rewrite_count: i64,
    pub lead_stage: String,
    pub can_send: bool,
}

/// Read-only status view for one lead.
pub fn status_payload_for(connection: &Connection, lead_id: i64) -> Result<LeadRunStatus, RunError> {
    let lead = get_lead(connection, lead_id)
        .map_err(RunError::Db)?
        .ok_or(RunError::LeadNotFound(lead_id))?;

    let Some(run) = find_active_run_for_lead(connection, lead_id)? else {
        let can_send = can_send_without_run(connection, lead_id, lead.campaign_id, &lead.stage)?;
        return Ok(LeadRunStatus {
            run_id: None,
            run_status: "none".to_string(),
            running_step: None,
            last_completed_step: None,
            next_step: can_send.then_some(StepSummary {
                id: None,
                agent_name: AgentName::Sender,
            }),
            rewrite_count: 0,
            lead_stage: lead.stage,
            can_send,
        });
    };

    let steps = list_steps(connection, run.id)?;
    let running_step = steps.iter().find(|step| step.status == StepStatus::Running);
    let last_completed = steps
        .iter()
        .filter(|step| step.status == StepStatus::Completed)
        .max_by_key(|step| step.position);
    let mut next_step = None;
    for step in steps.iter().filter(|step| step.status == StepStatus::Queued) {
        if ConfigResolver::load(connection, run.campaign_id, step.agent_name)
            .map_err(RunError::Db)?
            .enabled
        {
            next_step = Some(step);
            break;
        }
    }
    let can_send = next_step.is_some_and(|step| step.agent_name == AgentName::Sender);

    Ok(LeadRunStatus {
        run_id: Some(run.id),
        run_status: run.status.as_str().to_string(),
        running_step: running_step.map(StepSummary::from),
        last_completed_step: last_completed.map(StepSummary::from),
        next_step: next_step.map(StepSummary::from),
        rewrite_count: run.rewrite_count,
        lead_stage: lead.stage,
        can_send,
    })
}

fn can_send_without_run(
    connection: &Connection,
    lead_id: i64,
    campaign_id: i64,
    stage: &str,
) -> Result<bool, RunError> {
    if stage.starts_with(SENT_STAGE_PREFIX) {
        return Ok(false);
    }
    let campaign = get_campaign(connection, campaign_id)
        .map_err(RunError::Db)?
        .ok_or(RunError::CampaignNotFound(campaign_id))?;
    let sender = ConfigResolver::load_for_campaign(connection, &campaign, AgentName::Sender).map_err(RunError::Db)?;
    if !sender.enabled {
        return Ok(false);
    }
    let sources: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM agent_outputs
             WHERE lead_id = ?1 AND status = 'completed' AND agent_name IN ('DESIGN', 'WRITER')
               AND (json_extract(output_json, '$.formatted_email') IS NOT NULL
                    OR json_extract(output_json, '$.email') IS NOT NULL)",
            params![lead_id],
            |row| row.get(0),
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(sources > 0)
}

/// Marks an active run cancelled. A step already running is left to finish;
/// nothing new is claimed afterwards.
pub fn cancel_run(connection: &mut Connection, run_id: i64) -> Result<RunStatus, RunError> {
    let tx = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| RunError::Db(e.to_string()))?;
    let run = get_run(&tx, run_id)?;
    if !run.status.is_active() {
        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        return Ok(run.status);
    }
    let now = now_ms();
    tx.execute(
        "UPDATE lead_runs SET status = 'cancelled', finished_at_ms = ?1, updated_at_ms = ?1 WHERE id = ?2",
        params![now, run_id],
    )
    .map_err(|e| RunError::Db(e.to_string()))?;
    release_lead_pointer(&tx, run.lead_id, run_id)?;
    record_activity(
        &tx,
        run_id,
        None,
        "run_cancelled",
        Some(run.status.as_str()),
        Some(RunStatus::Cancelled.as_str()),
        "Run cancelled.",
    )?;
    tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
    info!(run_id, "run cancelled");
    Ok(RunStatus::Cancelled)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub run_id: i64,
    pub job_id: Option<u64>,
    /// Why nothing was enqueued, when `job_id` is empty.
    pub skipped_reason: Option<String>,
}

/// Caller-facing actions. Each one only enqueues jobs; workers do the work.
pub struct LeadRunActions<'a> {
    queue: &'a dyn JobQueue,
    pause: &'a dyn PauseGate,
    settings: ExecutorSettings,
}

impl<'a> LeadRunActions<'a> {
    pub fn new(queue: &'a dyn JobQueue, pause: &'a dyn PauseGate, settings: ExecutorSettings) -> Self {
        Self { queue, pause, settings }
    }

    pub fn start(&self, connection: &mut Connection, lead_id: i64) -> Result<ActionOutcome, RunError> {
        let run = ensure_active_run(connection, lead_id)?;
        if self.pause.is_paused() {
            return Ok(self.skipped(run.id, "paused"));
        }
        Ok(self.enqueue(run.id, None))
    }

    pub fn resume(&self, connection: &mut Connection, run_id: i64) -> Result<(ResumeDecision, ActionOutcome), RunError> {
        let decision = Resume::call(connection, run_id, &self.settings)?;
        let outcome = if !decision.enqueue {
            self.skipped(run_id, decision.reason.as_str())
        } else if self.pause.is_paused() {
            self.skipped(run_id, "paused")
        } else {
            self.enqueue(run_id, None)
        };
        Ok((decision, outcome))
    }

    pub fn run_next(
        &self,
        connection: &mut Connection,
        lead_id: i64,
        requested_agent: Option<AgentName>,
    ) -> Result<ActionOutcome, RunError> {
        let run = ensure_active_run(connection, lead_id)?;
        Ok(self.enqueue(run.id, requested_agent))
    }

    pub fn cancel(&self, connection: &mut Connection, run_id: i64) -> Result<RunStatus, RunError> {
        cancel_run(connection, run_id)
    }

    fn enqueue(&self, run_id: i64, requested_agent: Option<AgentName>) -> ActionOutcome {
        let payload = LeadRunJobPayload::new(run_id, requested_agent).to_value();
        let job_id = self.queue.enqueue(payload, Duration::ZERO);
        ActionOutcome {
            run_id,
            job_id: Some(job_id),
            skipped_reason: None,
        }
    }

    fn skipped(&self, run_id: i64, reason: &str) -> ActionOutcome {
        ActionOutcome {
            run_id,
            job_id: None,
            skipped_reason: Some(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{cancel_run, ensure_active_run, status_payload_for, LeadRunActions, StepSummary};
    use crate::agents::AgentRegistry;
    use crate::db::{bootstrap_schema, get_lead, insert_campaign, insert_lead, set_agent_enabled, upsert_agent_config, LeadInsert};
    use crate::executor::{ExecutorSettings, LeadRunExecutor};
    use crate::jobs::{InMemoryJobQueue, JobQueue};
    use crate::pause::PauseSwitch;
    use crate::schema::{AgentName, RunStatus};
    use crate::settings::Settings;
    use crate::store::get_run;
    use pretty_assertions::assert_eq;
    use rusqlite::{params, Connection};
    use serde_json::json;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    fn seed(conn: &Connection) -> (i64, i64) {
        let campaign_id = insert_campaign(conn, "Spring", &Settings::new()).expect("campaign");
        let lead_id = insert_lead(conn, &LeadInsert { campaign_id, ..LeadInsert::default() }).expect("lead");
        (campaign_id, lead_id)
    }

    #[test]
    fn ensure_active_run_reuses_the_existing_run() {
        let mut conn = setup_conn();
        let (_, lead_id) = seed(&conn);
        let first = ensure_active_run(&mut conn, lead_id).expect("first");
        let second = ensure_active_run(&mut conn, lead_id).expect("second");
        assert_eq!(first.id, second.id);
        let lead = get_lead(&conn, lead_id).expect("lead").expect("exists");
        assert_eq!(lead.current_lead_run_id, Some(first.id));
    }

    #[test]
    fn status_without_run_is_stable() {
        let conn = setup_conn();
        let (_, lead_id) = seed(&conn);
        let status = status_payload_for(&conn, lead_id).expect("status");
        assert_eq!(status.run_id, None);
        assert_eq!(status.run_status, "none");
        assert_eq!(status.next_step, None);
        assert_eq!(status.rewrite_count, 0);
        assert!(!status.can_send);
    }

    #[test]
    fn status_mid_run_skips_disabled_agents_for_next_step() {
        let mut conn = setup_conn();
        let (campaign_id, lead_id) = seed(&conn);
        let run = ensure_active_run(&mut conn, lead_id).expect("run");
        let executor = LeadRunExecutor::new(AgentRegistry::dry_run(), ExecutorSettings::default());
        executor.run_next(&mut conn, run.id, None).expect("search");
        set_agent_enabled(&conn, campaign_id, AgentName::Writer, false).expect("disable writer");

        let status = status_payload_for(&conn, lead_id).expect("status");
        assert_eq!(status.run_id, Some(run.id));
        assert_eq!(status.run_status, "running");
        assert_eq!(status.running_step, None);
        assert_eq!(
            status.last_completed_step.map(|step| step.agent_name),
            Some(AgentName::Search)
        );
        assert_eq!(status.next_step.map(|step| step.agent_name), Some(AgentName::Critique));
        assert_eq!(status.lead_stage, "searched");
        assert!(!status.can_send);
    }

    #[test]
    fn status_reports_send_ready_when_sender_is_next() {
        let mut conn = setup_conn();
        let (campaign_id, lead_id) = seed(&conn);
        for agent in [AgentName::Search, AgentName::Critique, AgentName::Design] {
            upsert_agent_config(&conn, campaign_id, agent, false, &Settings::new()).expect("disable");
        }
        upsert_agent_config(&conn, campaign_id, AgentName::Sender, true, &Settings::new()).expect("sender");
        let run = ensure_active_run(&mut conn, lead_id).expect("run");
        let executor = LeadRunExecutor::new(AgentRegistry::dry_run(), ExecutorSettings::default());
        executor.run_next(&mut conn, run.id, None).expect("writer");

        let status = status_payload_for(&conn, lead_id).expect("status");
        assert!(status.can_send);
        assert_eq!(status.next_step.map(|step| step.agent_name), Some(AgentName::Sender));
    }

    #[test]
    fn status_without_run_allows_send_retry_when_a_draft_exists() {
        let mut conn = setup_conn();
        let (campaign_id, lead_id) = seed(&conn);
        upsert_agent_config(&conn, campaign_id, AgentName::Sender, true, &Settings::new()).expect("sender");
        let run = ensure_active_run(&mut conn, lead_id).expect("run");
        let executor = LeadRunExecutor::new(AgentRegistry::dry_run(), ExecutorSettings::default());
        executor.run_next(&mut conn, run.id, None).expect("search");
        executor.run_next(&mut conn, run.id, None).expect("writer");
        cancel_run(&mut conn, run.id).expect("cancel");
        conn.execute("UPDATE leads SET stage = 'send_failed' WHERE id = ?1", params![lead_id])
            .expect("stage");

        let status = status_payload_for(&conn, lead_id).expect("status");
        assert_eq!(status.run_status, "none");
        assert!(status.can_send);
        assert_eq!(
            status.next_step,
            Some(StepSummary {
                id: None,
                agent_name: AgentName::Sender
            })
        );

        conn.execute("UPDATE leads SET stage = 'sent' WHERE id = ?1", params![lead_id])
            .expect("stage");
        assert!(!status_payload_for(&conn, lead_id).expect("status").can_send);
    }

    #[test]
    fn cancel_clears_the_lead_pointer_and_is_sticky() {
        let mut conn = setup_conn();
        let (_, lead_id) = seed(&conn);
        let run = ensure_active_run(&mut conn, lead_id).expect("run");

        assert_eq!(cancel_run(&mut conn, run.id).expect("cancel"), RunStatus::Cancelled);
        assert_eq!(cancel_run(&mut conn, run.id).expect("cancel again"), RunStatus::Cancelled);
        let stored = get_run(&conn, run.id).expect("run");
        assert!(stored.finished_at_ms.is_some());
        let lead = get_lead(&conn, lead_id).expect("lead").expect("exists");
        assert_eq!(lead.current_lead_run_id, None);

        let next = ensure_active_run(&mut conn, lead_id).expect("new run");
        assert_ne!(next.id, run.id);
    }

    #[test]
    fn actions_enqueue_unless_paused() {
        let mut conn = setup_conn();
        let (_, lead_id) = seed(&conn);
        let queue = InMemoryJobQueue::new();
        let pause = PauseSwitch::new(true);
        let actions = LeadRunActions::new(&queue, &pause, ExecutorSettings::default());

        let paused = actions.start(&mut conn, lead_id).expect("start paused");
        assert_eq!(paused.job_id, None);
        assert_eq!(paused.skipped_reason.as_deref(), Some("paused"));
        assert!(queue.is_empty());

        pause.resume();
        let started = actions.start(&mut conn, lead_id).expect("start");
        assert_eq!(started.run_id, paused.run_id);
        assert!(started.job_id.is_some());

        actions
            .run_next(&mut conn, lead_id, Some(AgentName::Writer))
            .expect("run next");
        let payloads: Vec<_> = queue.snapshot().into_iter().map(|job| job.payload).collect();
        assert_eq!(
            payloads,
            vec![
                json!({"run_id": started.run_id}),
                json!({"run_id": started.run_id, "requested_agent_name": "WRITER"}),
            ]
        );
    }

    #[test]
    fn resume_action_follows_the_decision() {
        let mut conn = setup_conn();
        let (_, lead_id) = seed(&conn);
        let queue = InMemoryJobQueue::new();
        let pause = PauseSwitch::default();
        let actions = LeadRunActions::new(&queue, &pause, ExecutorSettings::default());
        let run = ensure_active_run(&mut conn, lead_id).expect("run");

        let (decision, outcome) = actions.resume(&mut conn, run.id).expect("resume");
        assert!(decision.enqueue);
        assert!(outcome.job_id.is_some());

        actions.cancel(&mut conn, run.id).expect("cancel");
        let (decision, outcome) = actions.resume(&mut conn, run.id).expect("resume cancelled");
        assert!(!decision.enqueue);
        assert_eq!(outcome.skipped_reason.as_deref(), Some("terminal"));
        assert_eq!(queue.len(), 1);
    }
}
