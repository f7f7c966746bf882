use crate::clock::rfc3339_from_ms;
use crate::db::{get_agent_config, get_campaign, AgentConfigRecord, CampaignRecord};
use crate::schema::AgentName;
use crate::settings::{agent_defaults, deep_merge, Settings};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Effective configuration of one agent for one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAgentConfig {
    pub agent_name: AgentName,
    pub enabled: bool,
    pub settings_snapshot: Settings,
    pub config_id: Option<i64>,
    pub config_updated_at: Option<String>,
}

pub struct ConfigResolver;

impl ConfigResolver {
    /// Merges built-in defaults, campaign shared settings and the per-agent
    /// row, in increasing precedence.
    ///
    /// A missing row leaves the agent enabled, except for SENDER: sending
    /// requires an explicit, enabled configuration row.
    pub fn resolve(
        campaign: &CampaignRecord,
        agent: AgentName,
        config: Option<&AgentConfigRecord>,
    ) -> ResolvedAgentConfig {
        let with_shared = deep_merge(&agent_defaults(agent), &campaign.shared_settings);
        let settings_snapshot = match config {
            Some(row) => deep_merge(&with_shared, &row.settings),
            None => with_shared,
        };
        let enabled = match (agent, config) {
            (_, Some(row)) => row.enabled,
            (AgentName::Sender, None) => false,
            (_, None) => true,
        };

        ResolvedAgentConfig {
            agent_name: agent,
            enabled,
            settings_snapshot,
            config_id: config.map(|row| row.id),
            config_updated_at: config.map(|row| rfc3339_from_ms(row.updated_at_ms)),
        }
    }

    pub fn load(
        connection: &Connection,
        campaign_id: i64,
        agent: AgentName,
    ) -> Result<ResolvedAgentConfig, String> {
        let campaign = get_campaign(connection, campaign_id)?
            .ok_or_else(|| format!("campaign {campaign_id} not found"))?;
        Self::load_for_campaign(connection, &campaign, agent)
    }

    pub fn load_for_campaign(
        connection: &Connection,
        campaign: &CampaignRecord,
        agent: AgentName,
    ) -> Result<ResolvedAgentConfig, String> {
        let config = get_agent_config(connection, campaign.id, agent)?;
        Ok(Self::resolve(campaign, agent, config.as_ref()))
    }
}
