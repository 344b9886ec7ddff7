use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{AgentProfile, HttpSettings};
use crate::credential::TokenProvider;
use crate::error::AgentServiceError;
use crate::registry::ToolDescriptor;

const PAGE_SIZE: u32 = 100;

/// Lifecycle of a run as reported by the agent service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether the run may still change without our intervention.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress | Self::RequiresAction)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TextContent {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

impl ContentBlock {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(&text.value),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Body of an agent registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRequest {
    pub model: String,
    pub name: String,
    pub instructions: String,
    pub tools: Vec<Value>,
}

impl AgentRequest {
    pub fn new(profile: &AgentProfile, tools: &[ToolDescriptor]) -> Self {
        Self {
            model: profile.model.clone(),
            name: profile.name.clone(),
            instructions: profile.instructions.clone(),
            tools: tools.iter().map(ToolDescriptor::definition).collect(),
        }
    }
}

/// The slice of the hosted agent service this crate relies on.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn create_agent(&self, request: &AgentRequest) -> Result<String, AgentServiceError>;
    async fn delete_agent(&self, agent_id: &str) -> Result<(), AgentServiceError>;
    async fn create_thread(&self) -> Result<String, AgentServiceError>;
    async fn delete_thread(&self, thread_id: &str) -> Result<(), AgentServiceError>;
    async fn create_message(&self, thread_id: &str, content: &str)
        -> Result<String, AgentServiceError>;
    /// All messages of the thread, most recent first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AgentServiceError>;
    async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<Run, AgentServiceError>;
    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError>;
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct MessagePage {
    data: Vec<ThreadMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// REST client for the agent service under a project endpoint.
#[derive(Clone)]
pub struct HttpAgentService {
    http: Client,
    endpoint: Url,
    api_version: String,
    credential: Arc<dyn TokenProvider>,
}

impl HttpAgentService {
    pub fn new(
        endpoint: &Url,
        api_version: &str,
        credential: Arc<dyn TokenProvider>,
        http: &HttpSettings,
    ) -> Result<Self, AgentServiceError> {
        let mut endpoint = endpoint.clone();
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            http: http.client()?,
            endpoint,
            api_version: api_version.to_string(),
            credential,
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, AgentServiceError> {
        let mut url = self.endpoint.join(path).map_err(|e| AgentServiceError::Api {
            status: 0,
            message: format!("cannot build url for `{path}`: {e}"),
        })?;
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version)
            .extend_pairs(query.iter().copied());
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<reqwest::Response, AgentServiceError> {
        let token = self.credential.token().await?;
        debug!(method = method.as_str(), path = url.path(), "agent service request");

        let mut request = self.http.request(method, url).bearer_auth(token.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&text)
            .map(|e| e.error.message)
            .unwrap_or(text);
        Err(AgentServiceError::Api { status, message })
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T, AgentServiceError> {
        Ok(self.call(method, url, body).await?.json::<T>().await?)
    }
}

#[async_trait]
impl AgentService for HttpAgentService {
    async fn create_agent(&self, request: &AgentRequest) -> Result<String, AgentServiceError> {
        let body = serde_json::to_value(request).map_err(|e| AgentServiceError::Api {
            status: 0,
            message: format!("cannot encode agent request: {e}"),
        })?;
        let created: Created = self
            .call_json(Method::POST, self.url("assistants", &[])?, Some(body))
            .await?;
        Ok(created.id)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        let url = self.url(&format!("assistants/{agent_id}"), &[])?;
        self.call(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn create_thread(&self) -> Result<String, AgentServiceError> {
        let created: Created = self
            .call_json(Method::POST, self.url("threads", &[])?, Some(json!({})))
            .await?;
        Ok(created.id)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), AgentServiceError> {
        let url = self.url(&format!("threads/{thread_id}"), &[])?;
        self.call(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<String, AgentServiceError> {
        let url = self.url(&format!("threads/{thread_id}/messages"), &[])?;
        let created: Created = self
            .call_json(Method::POST, url, Some(json!({ "role": "user", "content": content })))
            .await?;
        Ok(created.id)
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AgentServiceError> {
        let path = format!("threads/{thread_id}/messages");
        let limit = PAGE_SIZE.to_string();
        let mut messages = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("order", "desc"), ("limit", limit.as_str())];
            if let Some(cursor) = after.as_deref() {
                query.push(("after", cursor));
            }
            let page: MessagePage = self
                .call_json(Method::GET, self.url(&path, &query)?, None)
                .await?;
            messages.extend(page.data);

            match (page.has_more, page.last_id) {
                (true, Some(last)) => after = Some(last),
                _ => break,
            }
        }
        Ok(messages)
    }

    async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<Run, AgentServiceError> {
        let url = self.url(&format!("threads/{thread_id}/runs"), &[])?;
        self.call_json(Method::POST, url, Some(json!({ "assistant_id": agent_id })))
            .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
        let url = self.url(&format!("threads/{thread_id}/runs/{run_id}"), &[])?;
        self.call_json(Method::GET, url, None).await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
        let url = self.url(&format!("threads/{thread_id}/runs/{run_id}/cancel"), &[])?;
        self.call_json(Method::POST, url, None).await
    }
}
