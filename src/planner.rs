use crate::clock::{now_ms, rfc3339_from_ms};
use crate::config_resolver::{ConfigResolver, ResolvedAgentConfig};
use crate::db::{get_campaign, get_lead};
use crate::schema::{AgentName, RunStatus, StepStatus, PIPELINE_ORDER};
use crate::settings::{
    integer_setting, settings_hash, DEFAULTS_VERSION, DEFAULT_MAX_REWRITES, DEFAULT_MIN_SCORE,
    MAX_REWRITES, MIN_SCORE_FOR_SEND,
};
use crate::store::{get_run, is_unique_violation, record_activity, RunError, RunRecord, StepMeta};
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

pub const PLANNER_VERSION: &str = "v1";
pub const POSITION_GAP: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("no agents are enabled for this campaign")]
    NoAgentsEnabled,
    #[error("CRITIQUE needs WRITER enabled")]
    CritiqueRequiresWriter,
    #[error("DESIGN needs WRITER enabled")]
    DesignRequiresWriter,
    #[error("SENDER needs WRITER enabled")]
    SendRequiresWriter,
}

impl PlannerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAgentsEnabled => "no_agents_enabled",
            Self::CritiqueRequiresWriter => "critique_requires_writer",
            Self::DesignRequiresWriter => "design_requires_writer",
            Self::SendRequiresWriter => "send_requires_writer",
        }
    }
}

pub struct LeadRunPlanner;

impl LeadRunPlanner {
    /// Picks the enabled agents in pipeline order and checks their
    /// dependencies.
    pub fn plan_agents(resolved: &[ResolvedAgentConfig]) -> Result<Vec<AgentName>, PlannerError> {
        let enabled: Vec<AgentName> = PIPELINE_ORDER
            .into_iter()
            .filter(|agent| {
                resolved
                    .iter()
                    .any(|config| config.agent_name == *agent && config.enabled)
            })
            .collect();

        if enabled.is_empty() {
            return Err(PlannerError::NoAgentsEnabled);
        }
        let has_writer = enabled.contains(&AgentName::Writer);
        if enabled.contains(&AgentName::Critique) && !has_writer {
            return Err(PlannerError::CritiqueRequiresWriter);
        }
        if enabled.contains(&AgentName::Design) && !has_writer {
            return Err(PlannerError::DesignRequiresWriter);
        }
        if enabled.contains(&AgentName::Sender) && !has_writer {
            return Err(PlannerError::SendRequiresWriter);
        }
        Ok(enabled)
    }

    /// Creates a queued run for the lead with one step per enabled agent.
    ///
    /// The run, its steps and the lead's active-run pointer are written in one
    /// transaction. When another run is already active for the lead the
    /// storage index rejects the insert and `RunError::ActiveRunExists` is
    /// returned; callers that want get-or-create semantics go through
    /// `lead_runs::ensure_active_run`.
    ///
    /// Settings captured here are provenance only. Each step freezes its own
    /// snapshot when it is claimed.
    pub fn build(connection: &mut Connection, lead_id: i64) -> Result<RunRecord, RunError> {
        let lead = get_lead(connection, lead_id)
            .map_err(RunError::Db)?
            .ok_or(RunError::LeadNotFound(lead_id))?;
        let campaign = get_campaign(connection, lead.campaign_id)
            .map_err(RunError::Db)?
            .ok_or(RunError::CampaignNotFound(lead.campaign_id))?;

        let resolved = PIPELINE_ORDER
            .into_iter()
            .map(|agent| ConfigResolver::load_for_campaign(connection, &campaign, agent))
            .collect::<Result<Vec<_>, _>>()
            .map_err(RunError::Db)?;
        let agents = Self::plan_agents(&resolved)?;

        let critique_settings = resolved
            .iter()
            .find(|config| config.agent_name == AgentName::Critique)
            .map(|config| config.settings_snapshot.clone())
            .unwrap_or_default();
        let min_score = integer_setting(&critique_settings, MIN_SCORE_FOR_SEND)
            .unwrap_or(DEFAULT_MIN_SCORE)
            .clamp(0, 10);
        let max_rewrites = integer_setting(&critique_settings, MAX_REWRITES)
            .unwrap_or(DEFAULT_MAX_REWRITES)
            .max(0);

        let now = now_ms();
        let config_snapshot = build_config_snapshot(&campaign.shared_settings, &resolved, &agents, now);
        let plan = json!({
            "steps": agents
                .iter()
                .map(|agent| json!({"agent_name": agent.as_str()}))
                .collect::<Vec<_>>()
        });

        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| RunError::Db(e.to_string()))?;

        tx.execute(
            "
            INSERT INTO lead_runs (
              lead_id, campaign_id, status, plan_json, config_snapshot_json,
              rewrite_count, max_rewrites, min_score, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8)
            ",
            params![
                lead.id,
                campaign.id,
                RunStatus::Queued.as_str(),
                plan.to_string(),
                config_snapshot.to_string(),
                max_rewrites,
                min_score,
                now
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                RunError::ActiveRunExists { lead_id: lead.id }
            } else {
                RunError::Db(e.to_string())
            }
        })?;
        let run_id = tx.last_insert_rowid();

        let mut step_ids: BTreeMap<AgentName, i64> = BTreeMap::new();
        for (index, agent) in agents.iter().enumerate() {
            let mut meta = StepMeta::new();
            match agent {
                AgentName::Critique => {
                    if let Some(writer_id) = step_ids.get(&AgentName::Writer) {
                        meta.insert("writer_step_id".into(), json!(writer_id));
                    }
                    meta.insert("selected_variant_index".into(), json!(0));
                }
                AgentName::Sender => {
                    let source = step_ids
                        .get(&AgentName::Design)
                        .or_else(|| step_ids.get(&AgentName::Writer));
                    if let Some(source_id) = source {
                        meta.insert("source_step_id".into(), json!(source_id));
                    }
                }
                _ => {}
            }

            tx.execute(
                "
                INSERT INTO lead_run_steps (
                  lead_run_id, position, agent_name, status, meta_json, created_at_ms, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ",
                params![
                    run_id,
                    (index as i64 + 1) * POSITION_GAP,
                    agent.as_str(),
                    StepStatus::Queued.as_str(),
                    Value::Object(meta).to_string(),
                    now
                ],
            )
            .map_err(|e| RunError::Db(e.to_string()))?;
            step_ids.insert(*agent, tx.last_insert_rowid());
        }

        tx.execute(
            "UPDATE leads SET current_lead_run_id = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![run_id, now, lead.id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;

        let agent_list = agents.iter().map(AgentName::as_str).collect::<Vec<_>>().join(", ");
        record_activity(
            &tx,
            run_id,
            None,
            "run_created",
            None,
            Some(RunStatus::Queued.as_str()),
            &format!("Run planned with steps: {agent_list}."),
        )?;

        tx.commit().map_err(|e| RunError::Db(e.to_string()))?;
        info!(run_id, lead_id, steps = %agent_list, "lead run planned");
        get_run(connection, run_id)
    }
}

fn build_config_snapshot(
    shared_settings: &crate::settings::Settings,
    resolved: &[ResolvedAgentConfig],
    agents: &[AgentName],
    planned_at_ms: i64,
) -> Value {
    let mut agent_entries = Map::new();
    for config in resolved.iter().filter(|config| agents.contains(&config.agent_name)) {
        agent_entries.insert(
            config.agent_name.as_str().to_string(),
            json!({
                "settings": Value::Object(config.settings_snapshot.clone()),
                "agent_config_id": config.config_id,
                "agent_config_updated_at": config.config_updated_at,
            }),
        );
    }

    json!({
        "planner_version": PLANNER_VERSION,
        "defaults_version": DEFAULTS_VERSION,
        "shared_settings_hash": settings_hash(shared_settings),
        "shared_settings": Value::Object(shared_settings.clone()),
        "planned_at": rfc3339_from_ms(planned_at_ms),
        "agents": Value::Object(agent_entries),
    })
}
