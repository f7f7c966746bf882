use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentName {
    Search,
    Writer,
    Critique,
    Design,
    Sender,
}

/// Canonical pipeline order. Planned steps always follow it.
pub const PIPELINE_ORDER: [AgentName; 5] = [
    AgentName::Search,
    AgentName::Writer,
    AgentName::Critique,
    AgentName::Design,
    AgentName::Sender,
];

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "SEARCH",
            Self::Writer => "WRITER",
            Self::Critique => "CRITIQUE",
            Self::Design => "DESIGN",
            Self::Sender => "SENDER",
        }
    }

    /// Agents whose settings end up inside an LLM prompt.
    pub fn feeds_llm_prompt(&self) -> bool {
        !matches!(self, Self::Sender)
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentName {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SEARCH" => Ok(Self::Search),
            "WRITER" => Ok(Self::Writer),
            "CRITIQUE" => Ok(Self::Critique),
            "DESIGN" => Ok(Self::Design),
            "SENDER" => Ok(Self::Sender),
            _ => Err(UnknownVariant::new("agent name", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(UnknownVariant::new("run status", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl FromStr for StepStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(UnknownVariant::new("step status", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Pending,
    Completed,
    Failed,
}

impl OutputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OutputStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownVariant::new("output status", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentName, RunStatus, StepStatus, PIPELINE_ORDER};
    use std::str::FromStr;

    #[test]
    fn agent_names_round_trip_through_storage_strings() {
        for agent in PIPELINE_ORDER {
            assert_eq!(AgentName::from_str(agent.as_str()), Ok(agent));
        }
        assert_eq!(AgentName::from_str(" writer "), Ok(AgentName::Writer));
        assert!(AgentName::from_str("PUBLISHER").is_err());
    }

    #[test]
    fn only_sender_skips_prompt_construction() {
        let llm: Vec<AgentName> = PIPELINE_ORDER
            .into_iter()
            .filter(|agent| agent.feeds_llm_prompt())
            .collect();
        assert_eq!(
            llm,
            vec![
                AgentName::Search,
                AgentName::Writer,
                AgentName::Critique,
                AgentName::Design
            ]
        );
    }

    #[test]
    fn terminal_statuses_are_classified() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Queued.is_active());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert_eq!(
            RunStatus::from_str("paused").expect_err("unknown").to_string(),
            "unknown run status `paused`"
        );
    }
}
