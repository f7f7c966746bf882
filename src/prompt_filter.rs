use crate::schema::AgentName;
use crate::settings::{Settings, MIN_SCORE_FOR_SEND};
use serde_json::Value;

/// Keys that steer orchestration and must never reach prompt construction.
const ORCHESTRATION_KEYS: &[&str] = &[MIN_SCORE_FOR_SEND];

pub struct PromptSettingsFilter;

impl PromptSettingsFilter {
    /// Returns a copy of `settings` safe to hand to the agent. For agents that
    /// build LLM prompts, orchestration keys are removed at every depth,
    /// including inside arrays. Other agents get an unchanged copy.
    pub fn filter(agent: AgentName, settings: &Settings) -> Settings {
        if !agent.feeds_llm_prompt() {
            return settings.clone();
        }
        strip_object(settings)
    }
}

fn strip_object(settings: &Settings) -> Settings {
    settings
        .iter()
        .filter(|(key, _)| !ORCHESTRATION_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), strip_value(value)))
        .collect()
}

fn strip_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(strip_object(map)),
        Value::Array(items) => Value::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}
