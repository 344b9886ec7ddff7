use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::agents::{AgentRequest, AgentService};
use crate::config::AgentProfile;
use crate::error::{ConfigError, TurnError};
use crate::registry::ToolDescriptor;

/// Who owns the remote agent registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// Every session registers its own agent and deletes it on close.
    PerRequest,
    /// One agent per process, reused by every session; deleted on shutdown.
    Shared,
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "per-request" | "request" => Ok(Self::PerRequest),
            "shared" | "process" => Ok(Self::Shared),
            other => Err(format!("unknown session policy `{other}`, expected per-request or shared")),
        }
    }
}

/// One agent + one thread on the agent service.
///
/// Release with [`Session::close`]; dropping a session leaks its remote resources.
pub struct Session {
    service: Arc<dyn AgentService>,
    thread_id: String,
    agent_id: String,
    owns_agent: bool,
}

impl Session {
    pub fn service(&self) -> &dyn AgentService {
        self.service.as_ref()
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Deletes the thread and, if this session registered it, the agent.
    /// Failures are logged, never returned.
    pub async fn close(self) {
        if let Err(e) = self.service.delete_thread(&self.thread_id).await {
            warn!(thread_id = %self.thread_id, error = %e, "failed to delete thread");
        }
        if self.owns_agent {
            match self.service.delete_agent(&self.agent_id).await {
                Ok(()) => info!(agent_id = %self.agent_id, "deleted agent"),
                Err(e) => warn!(agent_id = %self.agent_id, error = %e, "failed to delete agent"),
            }
        }
    }
}

pub struct SessionFactory {
    service: Arc<dyn AgentService>,
    request: AgentRequest,
    policy: SessionPolicy,
    shared_agent: OnceCell<String>,
}

impl SessionFactory {
    pub fn new(
        service: Arc<dyn AgentService>,
        profile: &AgentProfile,
        tool: &ToolDescriptor,
        policy: SessionPolicy,
    ) -> Result<Self, ConfigError> {
        tool.validate()?;
        Ok(Self {
            service,
            request: AgentRequest::new(profile, std::slice::from_ref(tool)),
            policy,
            shared_agent: OnceCell::new(),
        })
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Registers the shared agent up front. No-op for per-request sessions.
    pub async fn prepare(&self) -> Result<(), TurnError> {
        if self.policy == SessionPolicy::Shared {
            self.shared_agent_id().await?;
        }
        Ok(())
    }

    pub async fn create_session(&self) -> Result<Session, TurnError> {
        let (agent_id, owns_agent) = match self.policy {
            SessionPolicy::PerRequest => (self.register_agent().await?, true),
            SessionPolicy::Shared => (self.shared_agent_id().await?.to_string(), false),
        };

        let thread_id = match self.service.create_thread().await {
            Ok(id) => id,
            Err(e) => {
                if owns_agent {
                    if let Err(cleanup) = self.service.delete_agent(&agent_id).await {
                        warn!(%agent_id, error = %cleanup, "failed to delete agent of half-built session");
                    }
                }
                return Err(TurnError::SessionCreation(e));
            }
        };
        info!(%thread_id, "created thread");

        Ok(Session {
            service: Arc::clone(&self.service),
            thread_id,
            agent_id,
            owns_agent,
        })
    }

    pub async fn shutdown(&self) {
        if let Some(agent_id) = self.shared_agent.get() {
            match self.service.delete_agent(agent_id).await {
                Ok(()) => info!(%agent_id, "deleted shared agent"),
                Err(e) => warn!(%agent_id, error = %e, "failed to delete shared agent"),
            }
        }
    }

    async fn register_agent(&self) -> Result<String, TurnError> {
        let agent_id = self
            .service
            .create_agent(&self.request)
            .await
            .map_err(TurnError::SessionCreation)?;
        info!(%agent_id, "created agent");
        Ok(agent_id)
    }

    async fn shared_agent_id(&self) -> Result<&str, TurnError> {
        self.shared_agent
            .get_or_try_init(|| self.register_agent())
            .await
            .map(String::as_str)
    }
}
