use super::{AgentCapability, AgentError, AgentReply, AgentRequest};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Agent that replays a fixed list of replies and records what it was asked.
/// Once the script runs out it answers with `fallback`, if any.
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Result<AgentReply, AgentError>>>,
    fallback: Option<Value>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Result<AgentReply, AgentError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn completing(body: Value) -> Self {
        Self::new(Vec::new()).with_fallback(body)
    }

    pub fn with_fallback(mut self, body: Value) -> Self {
        self.fallback = Some(body);
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl AgentCapability for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        lock(&self.requests).push(request.clone());
        match lock(&self.replies).pop_front() {
            Some(reply) => reply,
            None => match &self.fallback {
                Some(body) => Ok(AgentReply::Completed(body.clone())),
                None => Err(AgentError::permanent(
                    "script_exhausted",
                    format!("no scripted reply left for {}", request.agent_name),
                )),
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
