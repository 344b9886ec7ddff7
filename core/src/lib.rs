pub mod agents;
pub mod config;
pub mod credential;
pub mod error;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod session;

#[cfg(test)]
mod fake;

pub use agents::{AgentService, HttpAgentService, RunStatus};
pub use config::Settings;
pub use error::{AgentServiceError, ConfigError, QueueError, TurnError};
pub use registry::ToolDescriptor;
pub use runtime::{Conversation, Runtime};
pub use session::{Session, SessionFactory, SessionPolicy};
