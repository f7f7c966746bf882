use super::{AgentCapability, AgentError, AgentReply, AgentRequest};
use crate::schema::AgentName;
use serde_json::{json, Value};

/// Deterministic stand-in used when no real agents are wired in. Every
/// critique passes. SENDER refuses, so a lead is never recorded as sent.
pub struct DryRunAgent;

impl AgentCapability for DryRunAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        let lead = &request.lead;
        let body = match request.agent_name {
            AgentName::Search => json!({
                "results": [],
                "query": format!("{} {}", lead.name, lead.company).trim().to_string(),
            }),
            AgentName::Writer => json!({
                "email": {
                    "subject": format!("Hello {}", lead.name),
                    "body": format!("Hi {},\n\nThis is a dry-run draft.", lead.name),
                },
                "revision": request
                    .inputs
                    .get("previous_critique")
                    .map(|_| 1)
                    .unwrap_or(0),
            }),
            AgentName::Critique => json!({"score": 10, "critique": "None"}),
            AgentName::Design => json!({
                "formatted_email": request.inputs.get("writer").cloned().unwrap_or(Value::Null),
            }),
            AgentName::Sender => {
                return Err(AgentError::permanent(
                    "no_delivery_transport",
                    "dry-run agents cannot deliver email",
                ))
            }
        };
        Ok(AgentReply::Completed(body))
    }
}
