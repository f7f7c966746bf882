use crate::clock::now_ms;
use crate::schema::AgentName;
use crate::settings::{canonical_json, settings_from_json, Settings};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: i64,
    pub name: String,
    pub shared_settings: Settings,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    pub email: String,
    pub company: String,
    pub title: String,
    pub stage: String,
    pub quality: Option<String>,
    pub current_lead_run_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadInsert {
    pub campaign_id: i64,
    pub name: String,
    pub email: String,
    pub company: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub agent_name: AgentName,
    pub enabled: bool,
    pub settings: Settings,
    pub updated_at_ms: i64,
}

/// Opens the engine database at `path`, applying connection pragmas and the
/// schema bootstrap. Parent directories are created as needed.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection, String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create database dir: {e}"))?;
        }
    }
    let mut connection =
        Connection::open(path).map_err(|e| format!("Failed to open sqlite db: {e}"))?;
    configure_connection(&connection, busy_timeout)?;
    bootstrap_schema(&mut connection)?;
    Ok(connection)
}

pub fn configure_connection(connection: &Connection, busy_timeout: Duration) -> Result<(), String> {
    connection
        .busy_timeout(busy_timeout)
        .map_err(|e| format!("Failed to set busy timeout: {e}"))?;
    connection
        .pragma_update(None, "foreign_keys", true)
        .map_err(|e| format!("Failed to enable foreign keys: {e}"))?;
    // In-memory databases report "memory" and ignore WAL.
    let _mode: String = connection
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(|e| format!("Failed to set journal mode: {e}"))?;
    Ok(())
}

pub fn bootstrap_schema(connection: &mut Connection) -> Result<(), String> {
    connection
        .execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS campaigns (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              shared_settings_json TEXT NOT NULL DEFAULT '{}',
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              campaign_id INTEGER NOT NULL,
              name TEXT NOT NULL DEFAULT '',
              email TEXT NOT NULL DEFAULT '',
              company TEXT NOT NULL DEFAULT '',
              title TEXT NOT NULL DEFAULT '',
              stage TEXT NOT NULL DEFAULT 'queued',
              current_lead_run_id INTEGER,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              FOREIGN KEY (campaign_id) REFERENCES campaigns(id)
            );

            CREATE TABLE IF NOT EXISTS agent_configs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              campaign_id INTEGER NOT NULL,
              agent_name TEXT NOT NULL,
              enabled INTEGER NOT NULL DEFAULT 1,
              settings_json TEXT NOT NULL DEFAULT '{}',
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE (campaign_id, agent_name),
              FOREIGN KEY (campaign_id) REFERENCES campaigns(id)
            );

            CREATE TABLE IF NOT EXISTS lead_runs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              lead_id INTEGER NOT NULL,
              campaign_id INTEGER NOT NULL,
              status TEXT NOT NULL
                CHECK (status IN ('queued', 'running', 'completed', 'failed', 'cancelled')),
              plan_json TEXT NOT NULL DEFAULT '{}',
              config_snapshot_json TEXT NOT NULL DEFAULT '{}',
              rewrite_count INTEGER NOT NULL DEFAULT 0 CHECK (rewrite_count >= 0),
              max_rewrites INTEGER NOT NULL DEFAULT 2 CHECK (max_rewrites >= 0),
              min_score INTEGER NOT NULL DEFAULT 6 CHECK (min_score BETWEEN 0 AND 10),
              started_at_ms INTEGER,
              finished_at_ms INTEGER,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              CHECK (rewrite_count <= max_rewrites),
              FOREIGN KEY (lead_id) REFERENCES leads(id),
              FOREIGN KEY (campaign_id) REFERENCES campaigns(id)
            );

            CREATE TABLE IF NOT EXISTS lead_run_steps (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              lead_run_id INTEGER NOT NULL,
              position INTEGER NOT NULL,
              agent_name TEXT NOT NULL,
              status TEXT NOT NULL
                CHECK (status IN ('queued', 'running', 'completed', 'failed', 'skipped')),
              meta_json TEXT NOT NULL DEFAULT '{}',
              agent_output_id INTEGER,
              step_started_at_ms INTEGER,
              step_finished_at_ms INTEGER,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE (lead_run_id, position),
              FOREIGN KEY (lead_run_id) REFERENCES lead_runs(id)
            );

            CREATE TABLE IF NOT EXISTS agent_outputs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              lead_id INTEGER NOT NULL,
              lead_run_id INTEGER NOT NULL,
              lead_run_step_id INTEGER NOT NULL UNIQUE,
              agent_name TEXT NOT NULL,
              status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
              output_json TEXT NOT NULL DEFAULT '{}',
              error_message TEXT,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              FOREIGN KEY (lead_id) REFERENCES leads(id),
              FOREIGN KEY (lead_run_id) REFERENCES lead_runs(id),
              FOREIGN KEY (lead_run_step_id) REFERENCES lead_run_steps(id)
            );

            CREATE TABLE IF NOT EXISTS run_activities (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              lead_run_id INTEGER NOT NULL,
              step_id INTEGER,
              activity_type TEXT NOT NULL,
              from_status TEXT,
              to_status TEXT,
              message TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (lead_run_id) REFERENCES lead_runs(id)
            );
            ",
        )
        .map_err(|e| format!("Failed to bootstrap schema: {e}"))?;

    // Added after the first release of the leads table.
    ensure_column(connection, "leads", "quality", "TEXT")?;

    connection
        .execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_lead_runs_one_active_per_lead
             ON lead_runs(lead_id) WHERE status IN ('queued', 'running')",
            [],
        )
        .map_err(|e| format!("Failed to create active run index: {e}"))?;
    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_lead_runs_status_created ON lead_runs(status, created_at_ms)",
            [],
        )
        .map_err(|e| format!("Failed to create run status index: {e}"))?;
    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_lead_run_steps_run_status_position
             ON lead_run_steps(lead_run_id, status, position)",
            [],
        )
        .map_err(|e| format!("Failed to create step status index: {e}"))?;
    connection
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_run_activities_run_created ON run_activities(lead_run_id, created_at_ms)",
            [],
        )
        .map_err(|e| format!("Failed to create run activity index: {e}"))?;

    Ok(())
}

fn ensure_column(
    connection: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<(), String> {
    let mut stmt = connection
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("Failed to inspect table {table}: {e}"))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("Failed to query table info for {table}: {e}"))?;

    while let Some(row) = rows
        .next()
        .map_err(|e| format!("Failed reading table info for {table}: {e}"))?
    {
        let name: String = row
            .get(1)
            .map_err(|e| format!("Failed parsing table info for {table}: {e}"))?;
        if name == column {
            return Ok(());
        }
    }

    connection
        .execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"),
            [],
        )
        .map_err(|e| format!("Failed adding column {column} to {table}: {e}"))?;
    Ok(())
}

pub fn insert_campaign(
    connection: &Connection,
    name: &str,
    shared_settings: &Settings,
) -> Result<i64, String> {
    let now = now_ms();
    connection
        .execute(
            "INSERT INTO campaigns (name, shared_settings_json, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?3)",
            params![name, canonical_json(shared_settings), now],
        )
        .map_err(|e| format!("Failed to insert campaign: {e}"))?;
    Ok(connection.last_insert_rowid())
}

pub fn update_campaign_shared_settings(
    connection: &Connection,
    campaign_id: i64,
    shared_settings: &Settings,
) -> Result<(), String> {
    connection
        .execute(
            "UPDATE campaigns SET shared_settings_json = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![canonical_json(shared_settings), now_ms(), campaign_id],
        )
        .map_err(|e| format!("Failed to update campaign settings: {e}"))?;
    Ok(())
}

pub fn get_campaign(connection: &Connection, campaign_id: i64) -> Result<Option<CampaignRecord>, String> {
    let row = connection
        .query_row(
            "SELECT id, name, shared_settings_json, updated_at_ms FROM campaigns WHERE id = ?1",
            params![campaign_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| format!("Failed to read campaign: {e}"))?;

    match row {
        Some((id, name, shared_json, updated_at_ms)) => Ok(Some(CampaignRecord {
            id,
            name,
            shared_settings: settings_from_json(&shared_json)
                .map_err(|e| format!("Failed to parse campaign settings: {e}"))?,
            updated_at_ms,
        })),
        None => Ok(None),
    }
}

pub fn insert_lead(connection: &Connection, lead: &LeadInsert) -> Result<i64, String> {
    let now = now_ms();
    connection
        .execute(
            "INSERT INTO leads (campaign_id, name, email, company, title, stage, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?6)",
            params![
                lead.campaign_id,
                lead.name,
                lead.email,
                lead.company,
                lead.title,
                now
            ],
        )
        .map_err(|e| format!("Failed to insert lead: {e}"))?;
    Ok(connection.last_insert_rowid())
}

pub fn get_lead(connection: &Connection, lead_id: i64) -> Result<Option<LeadRecord>, String> {
    connection
        .query_row(
            "SELECT id, campaign_id, name, email, company, title, stage, quality, current_lead_run_id
             FROM leads WHERE id = ?1",
            params![lead_id],
            |row| {
                Ok(LeadRecord {
                    id: row.get(0)?,
                    campaign_id: row.get(1)?,
                    name: row.get(2)?,
                    email: row.get(3)?,
                    company: row.get(4)?,
                    title: row.get(5)?,
                    stage: row.get(6)?,
                    quality: row.get(7)?,
                    current_lead_run_id: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to read lead: {e}"))
}

/// Creates or replaces the per-agent configuration row for a campaign and
/// returns its id. `updated_at_ms` always moves forward.
pub fn upsert_agent_config(
    connection: &Connection,
    campaign_id: i64,
    agent: AgentName,
    enabled: bool,
    settings: &Settings,
) -> Result<i64, String> {
    let now = now_ms();
    connection
        .execute(
            "
            INSERT INTO agent_configs (campaign_id, agent_name, enabled, settings_json, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(campaign_id, agent_name)
            DO UPDATE SET
              enabled = excluded.enabled,
              settings_json = excluded.settings_json,
              updated_at_ms = MAX(excluded.updated_at_ms, agent_configs.updated_at_ms + 1)
            ",
            params![campaign_id, agent.as_str(), enabled, canonical_json(settings), now],
        )
        .map_err(|e| format!("Failed to upsert agent config: {e}"))?;
    connection
        .query_row(
            "SELECT id FROM agent_configs WHERE campaign_id = ?1 AND agent_name = ?2",
            params![campaign_id, agent.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| format!("Failed to read agent config id: {e}"))
}

pub fn set_agent_enabled(
    connection: &Connection,
    campaign_id: i64,
    agent: AgentName,
    enabled: bool,
) -> Result<(), String> {
    let settings = get_agent_config(connection, campaign_id, agent)?
        .map(|config| config.settings)
        .unwrap_or_default();
    upsert_agent_config(connection, campaign_id, agent, enabled, &settings)?;
    Ok(())
}

pub fn get_agent_config(
    connection: &Connection,
    campaign_id: i64,
    agent: AgentName,
) -> Result<Option<AgentConfigRecord>, String> {
    let row = connection
        .query_row(
            "SELECT id, campaign_id, agent_name, enabled, settings_json, updated_at_ms
             FROM agent_configs WHERE campaign_id = ?1 AND agent_name = ?2",
            params![campaign_id, agent.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? == 1,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| format!("Failed to read agent config: {e}"))?;

    match row {
        Some((id, campaign_id, agent_text, enabled, settings_json, updated_at_ms)) => {
            Ok(Some(AgentConfigRecord {
                id,
                campaign_id,
                agent_name: AgentName::from_str(&agent_text).map_err(|e| e.to_string())?,
                enabled,
                settings: settings_from_json(&settings_json)
                    .map_err(|e| format!("Failed to parse agent settings: {e}"))?,
                updated_at_ms,
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        bootstrap_schema, get_agent_config, get_lead, insert_campaign, insert_lead,
        upsert_agent_config, LeadInsert,
    };
    use crate::schema::AgentName;
    use crate::settings::Settings;
    use rusqlite::{params, Connection};
    use serde_json::json;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    fn seed_lead(conn: &Connection) -> (i64, i64) {
        let campaign_id = insert_campaign(conn, "Spring", &Settings::new()).expect("campaign");
        let lead_id = insert_lead(
            conn,
            &LeadInsert {
                campaign_id,
                name: "Ada".into(),
                email: "ada@example.com".into(),
                ..LeadInsert::default()
            },
        )
        .expect("lead");
        (campaign_id, lead_id)
    }

    fn insert_run(conn: &Connection, lead_id: i64, campaign_id: i64, status: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO lead_runs (lead_id, campaign_id, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, 0, 0)",
            params![lead_id, campaign_id, status],
        )
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let mut conn = setup_conn();
        bootstrap_schema(&mut conn).expect("second bootstrap");
        let lead = {
            let (_, lead_id) = seed_lead(&conn);
            get_lead(&conn, lead_id).expect("read").expect("exists")
        };
        assert_eq!(lead.stage, "queued");
        assert_eq!(lead.quality, None);
    }

    #[test]
    fn second_active_run_for_a_lead_is_rejected() {
        let conn = setup_conn();
        let (campaign_id, lead_id) = seed_lead(&conn);

        insert_run(&conn, lead_id, campaign_id, "queued").expect("first run");
        let err = insert_run(&conn, lead_id, campaign_id, "running").expect_err("second active run");
        assert!(err.to_string().contains("UNIQUE"), "{err}");

        // Terminal runs do not count toward the active limit.
        insert_run(&conn, lead_id, campaign_id, "completed").expect("terminal run");
        insert_run(&conn, lead_id, campaign_id, "failed").expect("terminal run");
    }

    #[test]
    fn min_score_and_rewrite_bounds_are_checked() {
        let conn = setup_conn();
        let (campaign_id, lead_id) = seed_lead(&conn);
        let out_of_range = conn.execute(
            "INSERT INTO lead_runs (lead_id, campaign_id, status, min_score, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, 'completed', 11, 0, 0)",
            params![lead_id, campaign_id],
        );
        assert!(out_of_range.is_err());

        let over_rewrites = conn.execute(
            "INSERT INTO lead_runs (lead_id, campaign_id, status, rewrite_count, max_rewrites, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, 'completed', 3, 2, 0, 0)",
            params![lead_id, campaign_id],
        );
        assert!(over_rewrites.is_err());
    }

    #[test]
    fn agent_config_upsert_advances_updated_at() {
        let conn = setup_conn();
        let (campaign_id, _) = seed_lead(&conn);
        let settings = json!({"tone": "warm"}).as_object().cloned().expect("object");

        let first_id =
            upsert_agent_config(&conn, campaign_id, AgentName::Writer, true, &settings).expect("insert");
        let first = get_agent_config(&conn, campaign_id, AgentName::Writer)
            .expect("read")
            .expect("exists");
        let second_id =
            upsert_agent_config(&conn, campaign_id, AgentName::Writer, false, &settings).expect("update");
        let second = get_agent_config(&conn, campaign_id, AgentName::Writer)
            .expect("read")
            .expect("exists");

        assert_eq!(first_id, second_id);
        assert!(!second.enabled);
        assert!(second.updated_at_ms > first.updated_at_ms);
        assert_eq!(second.settings.get("tone"), Some(&json!("warm")));
    }
}
