use crate::schema::AgentName;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Agent settings tree. `serde_json::Map` keeps string keys in sorted order,
/// so serialized snapshots are canonical.
pub type Settings = Map<String, Value>;

pub const DEFAULTS_VERSION: &str = "v1";

/// Orchestration key that gates sending. Never part of a prompt.
pub const MIN_SCORE_FOR_SEND: &str = "min_score_for_send";
pub const MAX_REWRITES: &str = "max_rewrites";

pub const DEFAULT_MIN_SCORE: i64 = 6;
pub const DEFAULT_MAX_REWRITES: i64 = 2;

/// Built-in settings for an agent before campaign overrides are applied.
pub fn agent_defaults(agent: AgentName) -> Settings {
    let value = match agent {
        AgentName::Writer => json!({
            "product_info": "",
            "sender_company": ""
        }),
        AgentName::Critique => json!({
            "strictness": "moderate",
            "min_score_for_send": DEFAULT_MIN_SCORE,
            "rewrite_policy": "rewrite_if_bad",
            "variant_selection": "highest_overall_score",
            "checks": {
                "check_personalization": true,
                "check_brand_voice": true,
                "check_spamminess": true
            },
            "max_rewrites": DEFAULT_MAX_REWRITES
        }),
        AgentName::Search | AgentName::Design | AgentName::Sender => json!({}),
    };
    match value {
        Value::Object(map) => map,
        _ => Settings::new(),
    }
}

/// Merges `overlay` onto `base` and returns a new tree. Nested objects merge
/// key by key; any other overlay value replaces the base value.
pub fn deep_merge(base: &Settings, overlay: &Settings) -> Settings {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match (merged.get(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                Value::Object(deep_merge(existing, incoming))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Interprets a JSON column as a settings tree. Anything other than an object
/// is treated as empty.
pub fn settings_from_value(value: Value) -> Settings {
    match value {
        Value::Object(map) => map,
        _ => Settings::new(),
    }
}

pub fn settings_from_json(raw: &str) -> Result<Settings, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    Ok(settings_from_value(value))
}

pub fn canonical_json(settings: &Settings) -> String {
    Value::Object(settings.clone()).to_string()
}

pub fn settings_hash(settings: &Settings) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(settings).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Reads an integer setting, accepting floats and numeric strings.
pub fn integer_setting(settings: &Settings, key: &str) -> Option<i64> {
    match settings.get(key)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f.floor() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}
