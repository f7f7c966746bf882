use crate::clock::now_ms;
use crate::planner::PlannerError;
use crate::schema::{AgentName, OutputStatus, RunStatus, StepStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

pub type StepMeta = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("database error: {0}")]
    Db(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("run {0} not found")]
    RunNotFound(i64),
    #[error("step {0} not found")]
    StepNotFound(i64),
    #[error("lead {0} not found")]
    LeadNotFound(i64),
    #[error("campaign {0} not found")]
    CampaignNotFound(i64),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("lead {lead_id} already has an active run")]
    ActiveRunExists { lead_id: i64 },
    #[error(transparent)]
    Planner(#[from] PlannerError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub lead_id: i64,
    pub campaign_id: i64,
    pub status: RunStatus,
    pub plan: Value,
    pub config_snapshot: Value,
    pub rewrite_count: i64,
    pub max_rewrites: i64,
    pub min_score: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: i64,
    pub lead_run_id: i64,
    pub position: i64,
    pub agent_name: AgentName,
    pub status: StepStatus,
    pub meta: StepMeta,
    pub agent_output_id: Option<i64>,
    pub step_started_at_ms: Option<i64>,
    pub step_finished_at_ms: Option<i64>,
}

impl StepRecord {
    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.meta.get(key).and_then(Value::as_i64)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub id: i64,
    pub lead_id: i64,
    pub lead_run_id: i64,
    pub lead_run_step_id: i64,
    pub agent_name: AgentName,
    pub status: OutputStatus,
    pub output: Value,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutputInsert<'a> {
    pub lead_id: i64,
    pub lead_run_id: i64,
    pub lead_run_step_id: i64,
    pub agent_name: AgentName,
    pub status: OutputStatus,
    pub output: &'a Value,
    pub error_message: Option<&'a str>,
}

const RUN_COLUMNS: &str = "id, lead_id, campaign_id, status, plan_json, config_snapshot_json,
    rewrite_count, max_rewrites, min_score, started_at_ms, finished_at_ms";

const STEP_COLUMNS: &str = "id, lead_run_id, position, agent_name, status, meta_json,
    agent_output_id, step_started_at_ms, step_finished_at_ms";

const OUTPUT_COLUMNS: &str = "id, lead_id, lead_run_id, lead_run_step_id, agent_name, status,
    output_json, error_message";

fn conversion_error<E>(error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::ToSqlConversionFailure(Box::new(error))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_text: String = row.get(3)?;
    let plan_json: String = row.get(4)?;
    let snapshot_json: String = row.get(5)?;
    Ok(RunRecord {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        campaign_id: row.get(2)?,
        status: RunStatus::from_str(&status_text).map_err(conversion_error)?,
        plan: serde_json::from_str(&plan_json).map_err(conversion_error)?,
        config_snapshot: serde_json::from_str(&snapshot_json).map_err(conversion_error)?,
        rewrite_count: row.get(6)?,
        max_rewrites: row.get(7)?,
        min_score: row.get(8)?,
        started_at_ms: row.get(9)?,
        finished_at_ms: row.get(10)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    let agent_text: String = row.get(3)?;
    let status_text: String = row.get(4)?;
    let meta_json: String = row.get(5)?;
    let meta = match serde_json::from_str::<Value>(&meta_json).map_err(conversion_error)? {
        Value::Object(map) => map,
        _ => StepMeta::new(),
    };
    Ok(StepRecord {
        id: row.get(0)?,
        lead_run_id: row.get(1)?,
        position: row.get(2)?,
        agent_name: AgentName::from_str(&agent_text).map_err(conversion_error)?,
        status: StepStatus::from_str(&status_text).map_err(conversion_error)?,
        meta,
        agent_output_id: row.get(6)?,
        step_started_at_ms: row.get(7)?,
        step_finished_at_ms: row.get(8)?,
    })
}

fn output_from_row(row: &Row<'_>) -> rusqlite::Result<OutputRecord> {
    let agent_text: String = row.get(4)?;
    let status_text: String = row.get(5)?;
    let output_json: String = row.get(6)?;
    Ok(OutputRecord {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        lead_run_id: row.get(2)?,
        lead_run_step_id: row.get(3)?,
        agent_name: AgentName::from_str(&agent_text).map_err(conversion_error)?,
        status: OutputStatus::from_str(&status_text).map_err(conversion_error)?,
        output: serde_json::from_str(&output_json).map_err(conversion_error)?,
        error_message: row.get(7)?,
    })
}

pub fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub fn get_run(connection: &Connection, run_id: i64) -> Result<RunRecord, RunError> {
    connection
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM lead_runs WHERE id = ?1"),
            params![run_id],
            run_from_row,
        )
        .map_err(|e| {
            if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                RunError::RunNotFound(run_id)
            } else {
                RunError::Db(e.to_string())
            }
        })
}

pub fn find_run(connection: &Connection, run_id: i64) -> Result<Option<RunRecord>, RunError> {
    connection
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM lead_runs WHERE id = ?1"),
            params![run_id],
            run_from_row,
        )
        .optional()
        .map_err(|e| RunError::Db(e.to_string()))
}

pub fn find_active_run_for_lead(
    connection: &Connection,
    lead_id: i64,
) -> Result<Option<RunRecord>, RunError> {
    connection
        .query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM lead_runs
                 WHERE lead_id = ?1 AND status IN ('queued', 'running')
                 ORDER BY id DESC LIMIT 1"
            ),
            params![lead_id],
            run_from_row,
        )
        .optional()
        .map_err(|e| RunError::Db(e.to_string()))
}

/// Active run ids, oldest first. Cancelled runs that still hold a running
/// step are included so its output can be finalized.
pub fn list_active_run_ids(connection: &Connection, limit: usize) -> Result<Vec<i64>, RunError> {
    let mut stmt = connection
        .prepare(
            "SELECT id FROM lead_runs
             WHERE status IN ('queued', 'running')
                OR (status = 'cancelled' AND EXISTS (
                      SELECT 1 FROM lead_run_steps s
                      WHERE s.lead_run_id = lead_runs.id AND s.status = 'running'))
             ORDER BY created_at_ms ASC, id ASC LIMIT ?1",
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    let rows = stmt
        .query_map(params![limit as i64], |row| row.get::<_, i64>(0))
        .map_err(|e| RunError::Db(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RunError::Db(e.to_string()))
}

pub fn list_steps(connection: &Connection, run_id: i64) -> Result<Vec<StepRecord>, RunError> {
    let mut stmt = connection
        .prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM lead_run_steps WHERE lead_run_id = ?1 ORDER BY position ASC"
        ))
        .map_err(|e| RunError::Db(e.to_string()))?;
    let rows = stmt
        .query_map(params![run_id], step_from_row)
        .map_err(|e| RunError::Db(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RunError::Db(e.to_string()))
}

pub fn get_step(connection: &Connection, step_id: i64) -> Result<StepRecord, RunError> {
    connection
        .query_row(
            &format!("SELECT {STEP_COLUMNS} FROM lead_run_steps WHERE id = ?1"),
            params![step_id],
            step_from_row,
        )
        .map_err(|e| {
            if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                RunError::StepNotFound(step_id)
            } else {
                RunError::Db(e.to_string())
            }
        })
}

pub fn first_step_with_status(
    connection: &Connection,
    run_id: i64,
    status: StepStatus,
) -> Result<Option<StepRecord>, RunError> {
    connection
        .query_row(
            &format!(
                "SELECT {STEP_COLUMNS} FROM lead_run_steps
                 WHERE lead_run_id = ?1 AND status = ?2
                 ORDER BY position ASC LIMIT 1"
            ),
            params![run_id, status.as_str()],
            step_from_row,
        )
        .optional()
        .map_err(|e| RunError::Db(e.to_string()))
}

pub fn count_steps_with_status(
    connection: &Connection,
    run_id: i64,
    status: StepStatus,
) -> Result<i64, RunError> {
    connection
        .query_row(
            "SELECT COUNT(*) FROM lead_run_steps WHERE lead_run_id = ?1 AND status = ?2",
            params![run_id, status.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| RunError::Db(e.to_string()))
}

/// Most recent step of `agent` in the given status, by position.
pub fn last_step_for_agent(
    connection: &Connection,
    run_id: i64,
    agent: AgentName,
    status: StepStatus,
) -> Result<Option<StepRecord>, RunError> {
    connection
        .query_row(
            &format!(
                "SELECT {STEP_COLUMNS} FROM lead_run_steps
                 WHERE lead_run_id = ?1 AND agent_name = ?2 AND status = ?3
                 ORDER BY position DESC LIMIT 1"
            ),
            params![run_id, agent.as_str(), status.as_str()],
            step_from_row,
        )
        .optional()
        .map_err(|e| RunError::Db(e.to_string()))
}

pub fn update_step_meta(connection: &Connection, step_id: i64, meta: &StepMeta) -> Result<(), RunError> {
    let meta_json =
        serde_json::to_string(meta).map_err(|e| RunError::Serde(e.to_string()))?;
    connection
        .execute(
            "UPDATE lead_run_steps SET meta_json = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![meta_json, now_ms(), step_id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(())
}

pub fn get_output(connection: &Connection, output_id: i64) -> Result<Option<OutputRecord>, RunError> {
    connection
        .query_row(
            &format!("SELECT {OUTPUT_COLUMNS} FROM agent_outputs WHERE id = ?1"),
            params![output_id],
            output_from_row,
        )
        .optional()
        .map_err(|e| RunError::Db(e.to_string()))
}

pub fn output_for_step(connection: &Connection, step_id: i64) -> Result<Option<OutputRecord>, RunError> {
    connection
        .query_row(
            &format!("SELECT {OUTPUT_COLUMNS} FROM agent_outputs WHERE lead_run_step_id = ?1"),
            params![step_id],
            output_from_row,
        )
        .optional()
        .map_err(|e| RunError::Db(e.to_string()))
}

/// Writes the output for a step. When another worker already wrote one, the
/// existing row is returned untouched.
pub fn insert_output(connection: &Connection, insert: &OutputInsert<'_>) -> Result<OutputRecord, RunError> {
    let output_json =
        serde_json::to_string(insert.output).map_err(|e| RunError::Serde(e.to_string()))?;
    let now = now_ms();
    connection
        .execute(
            "
            INSERT INTO agent_outputs (
              lead_id, lead_run_id, lead_run_step_id, agent_name, status,
              output_json, error_message, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(lead_run_step_id) DO NOTHING
            ",
            params![
                insert.lead_id,
                insert.lead_run_id,
                insert.lead_run_step_id,
                insert.agent_name.as_str(),
                insert.status.as_str(),
                output_json,
                insert.error_message,
                now
            ],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;

    output_for_step(connection, insert.lead_run_step_id)?
        .ok_or(RunError::StepNotFound(insert.lead_run_step_id))
}

pub fn update_output(
    connection: &Connection,
    output_id: i64,
    status: OutputStatus,
    output: &Value,
    error_message: Option<&str>,
) -> Result<(), RunError> {
    let output_json = serde_json::to_string(output).map_err(|e| RunError::Serde(e.to_string()))?;
    connection
        .execute(
            "UPDATE agent_outputs
             SET status = ?1, output_json = ?2, error_message = ?3, updated_at_ms = ?4
             WHERE id = ?5",
            params![status.as_str(), output_json, error_message, now_ms(), output_id],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(())
}

pub fn record_activity(
    connection: &Connection,
    run_id: i64,
    step_id: Option<i64>,
    activity_type: &str,
    from_status: Option<&str>,
    to_status: Option<&str>,
    message: &str,
) -> Result<(), RunError> {
    connection
        .execute(
            "
            INSERT INTO run_activities (
              lead_run_id, step_id, activity_type, from_status, to_status, message, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                run_id,
                step_id,
                activity_type,
                from_status,
                to_status,
                truncate_chars(message, 500),
                now_ms()
            ],
        )
        .map_err(|e| RunError::Db(e.to_string()))?;
    Ok(())
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::{get_run, insert_output, list_active_run_ids, output_for_step, OutputInsert, RunError};
    use crate::db::{bootstrap_schema, insert_campaign, insert_lead, LeadInsert};
    use crate::schema::{AgentName, OutputStatus};
    use crate::settings::Settings;
    use rusqlite::{params, Connection};
    use serde_json::json;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    fn seed_run_with_step(conn: &Connection) -> (i64, i64, i64) {
        let campaign_id = insert_campaign(conn, "Spring", &Settings::new()).expect("campaign");
        let lead_id = insert_lead(conn, &LeadInsert { campaign_id, ..LeadInsert::default() }).expect("lead");
        conn.execute(
            "INSERT INTO lead_runs (lead_id, campaign_id, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, 'running', 0, 0)",
            params![lead_id, campaign_id],
        )
        .expect("run");
        let run_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO lead_run_steps (lead_run_id, position, agent_name, status, created_at_ms, updated_at_ms)
             VALUES (?1, 10, 'WRITER', 'running', 0, 0)",
            params![run_id],
        )
        .expect("step");
        (lead_id, run_id, conn.last_insert_rowid())
    }

    #[test]
    fn missing_run_maps_to_not_found() {
        let conn = setup_conn();
        assert!(matches!(get_run(&conn, 999), Err(RunError::RunNotFound(999))));
    }

    #[test]
    fn second_output_for_a_step_returns_the_first() {
        let conn = setup_conn();
        let (lead_id, run_id, step_id) = seed_run_with_step(&conn);
        let first_body = json!({"email": "first"});
        let second_body = json!({"email": "second"});

        let first = insert_output(
            &conn,
            &OutputInsert {
                lead_id,
                lead_run_id: run_id,
                lead_run_step_id: step_id,
                agent_name: AgentName::Writer,
                status: OutputStatus::Completed,
                output: &first_body,
                error_message: None,
            },
        )
        .expect("first insert");
        let second = insert_output(
            &conn,
            &OutputInsert {
                lead_id,
                lead_run_id: run_id,
                lead_run_step_id: step_id,
                agent_name: AgentName::Writer,
                status: OutputStatus::Failed,
                output: &second_body,
                error_message: Some("late"),
            },
        )
        .expect("second insert");

        assert_eq!(first.id, second.id);
        assert_eq!(second.output, first_body);
        let stored = output_for_step(&conn, step_id).expect("read").expect("exists");
        assert_eq!(stored.status, OutputStatus::Completed);
    }

    #[test]
    fn active_runs_are_listed_oldest_first() {
        let conn = setup_conn();
        let (_, run_id, _) = seed_run_with_step(&conn);
        let (_, second_run_id, _) = seed_run_with_step(&conn);
        conn.execute("UPDATE lead_runs SET status = 'completed' WHERE id = ?1", params![second_run_id])
            .expect("finish");
        assert_eq!(list_active_run_ids(&conn, 10).expect("list"), vec![run_id]);
    }

    #[test]
    fn cancelled_runs_with_an_in_flight_step_are_listed() {
        let conn = setup_conn();
        let (_, in_flight, _) = seed_run_with_step(&conn);
        let (_, settled, settled_step) = seed_run_with_step(&conn);
        conn.execute("UPDATE lead_runs SET status = 'cancelled' WHERE id IN (?1, ?2)", params![in_flight, settled])
            .expect("cancel");
        conn.execute("UPDATE lead_run_steps SET status = 'completed' WHERE id = ?1", params![settled_step])
            .expect("settle");
        assert_eq!(list_active_run_ids(&conn, 10).expect("list"), vec![in_flight]);
    }
}
