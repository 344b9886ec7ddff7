//! Scripted agent service for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::agents::{
    AgentRequest, AgentService, ContentBlock, Role, Run, RunStatus, TextContent, ThreadMessage,
};
use crate::error::AgentServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateAgent,
    DeleteAgent(String),
    CreateThread,
    DeleteThread(String),
    CreateMessage { thread_id: String, content: String },
    ListMessages,
    CreateRun { agent_id: String },
    GetRun,
    CancelRun,
}

#[derive(Default)]
pub struct ScriptedAgentService {
    ids: AtomicUsize,
    statuses: Mutex<VecDeque<RunStatus>>,
    messages: Mutex<Vec<ThreadMessage>>,
    calls: Mutex<Vec<Call>>,
    failing: Option<&'static str>,
    hanging: Vec<&'static str>,
}

impl ScriptedAgentService {
    /// Statuses returned by `create_run` then each `get_run`; the last one sticks.
    pub fn with_statuses(self, statuses: &[RunStatus]) -> Self {
        *self.statuses.lock().unwrap() = statuses.iter().copied().collect();
        self
    }

    /// Thread contents returned by `list_messages`, most recent first.
    pub fn with_messages(self, messages: Vec<ThreadMessage>) -> Self {
        *self.messages.lock().unwrap() = messages;
        self
    }

    pub fn failing(mut self, operation: &'static str) -> Self {
        self.failing = Some(operation);
        self
    }

    /// The named operation is recorded and then never completes.
    pub fn hanging(mut self, operation: &'static str) -> Self {
        self.hanging.push(operation);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, operation: &'static str, call: Call) -> Result<(), AgentServiceError> {
        self.calls.lock().unwrap().push(call);
        if self.hanging.contains(&operation) {
            std::future::pending::<()>().await;
        }
        if self.failing == Some(operation) {
            return Err(AgentServiceError::Api {
                status: 500,
                message: format!("{operation} unavailable"),
            });
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn next_run(&self) -> Run {
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front().unwrap_or(RunStatus::Completed)
        } else {
            statuses.front().copied().unwrap_or(RunStatus::Completed)
        };
        Run {
            id: "run-1".to_string(),
            thread_id: String::new(),
            status,
            last_error: None,
        }
    }
}

pub fn message(role: Role, texts: &[&str]) -> ThreadMessage {
    ThreadMessage {
        id: format!("msg-{}", texts.join("-").len()),
        role,
        content: texts
            .iter()
            .map(|t| ContentBlock::Text { text: TextContent { value: t.to_string() } })
            .collect(),
    }
}

#[async_trait]
impl AgentService for ScriptedAgentService {
    async fn create_agent(&self, _request: &AgentRequest) -> Result<String, AgentServiceError> {
        self.record("create_agent", Call::CreateAgent).await?;
        Ok(self.next_id("agent"))
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        self.record("delete_agent", Call::DeleteAgent(agent_id.to_string())).await
    }

    async fn create_thread(&self) -> Result<String, AgentServiceError> {
        self.record("create_thread", Call::CreateThread).await?;
        Ok(self.next_id("thread"))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), AgentServiceError> {
        self.record("delete_thread", Call::DeleteThread(thread_id.to_string())).await
    }

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<String, AgentServiceError> {
        self.record(
            "create_message",
            Call::CreateMessage { thread_id: thread_id.to_string(), content: content.to_string() },
        )
        .await?;
        Ok(self.next_id("msg"))
    }

    async fn list_messages(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, AgentServiceError> {
        self.record("list_messages", Call::ListMessages).await?;
        Ok(self.messages.lock().unwrap().clone())
    }

    async fn create_run(&self, _thread_id: &str, agent_id: &str) -> Result<Run, AgentServiceError> {
        self.record("create_run", Call::CreateRun { agent_id: agent_id.to_string() }).await?;
        Ok(self.next_run())
    }

    async fn get_run(&self, _thread_id: &str, _run_id: &str) -> Result<Run, AgentServiceError> {
        self.record("get_run", Call::GetRun).await?;
        Ok(self.next_run())
    }

    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> Result<Run, AgentServiceError> {
        self.record("cancel_run", Call::CancelRun).await?;
        let mut run = self.next_run();
        run.status = RunStatus::Cancelling;
        Ok(run)
    }
}
