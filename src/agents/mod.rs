mod dry_run;
mod scripted;

pub use dry_run::DryRunAgent;
pub use scripted::ScriptedAgent;

use crate::db::LeadRecord;
use crate::schema::{AgentName, PIPELINE_ORDER};
use crate::settings::Settings;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Everything an agent gets to see for one step.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub run_id: i64,
    pub step_id: i64,
    pub agent_name: AgentName,
    pub lead: LeadRecord,
    /// Frozen snapshot with orchestration keys already filtered out.
    pub settings: Settings,
    /// Upstream outputs keyed by role (`search`, `writer`, `critique`,
    /// `previous_critique`, `source`).
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    Completed(Value),
    /// Work handed to an external system. The step stays running until the
    /// outcome is reported back through `LeadRunExecutor::complete_deferred_step`.
    Deferred { handle: String, data: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub code: String,
    pub message: String,
}

impl AgentError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AgentErrorKind::Transient,
            code: "agent_unavailable".to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: AgentErrorKind::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, AgentErrorKind::Transient)
    }
}

pub trait AgentCapability: Send + Sync {
    fn run(&self, request: &AgentRequest) -> Result<AgentReply, AgentError>;
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentName, Arc<dyn AgentCapability>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that answers every agent with canned output. Its SENDER fails
    /// permanently instead of sending.
    pub fn dry_run() -> Self {
        let agent: Arc<dyn AgentCapability> = Arc::new(DryRunAgent);
        let mut registry = Self::new();
        for name in PIPELINE_ORDER {
            registry.register(name, Arc::clone(&agent));
        }
        registry
    }

    pub fn register(&mut self, agent: AgentName, capability: Arc<dyn AgentCapability>) {
        self.agents.insert(agent, capability);
    }

    pub fn with(mut self, agent: AgentName, capability: Arc<dyn AgentCapability>) -> Self {
        self.register(agent, capability);
        self
    }

    pub fn get(&self, agent: AgentName) -> Option<Arc<dyn AgentCapability>> {
        self.agents.get(&agent).cloned()
    }
}
