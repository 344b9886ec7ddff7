use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable `{0}` is not set")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("malformed storage connection string: {0}")]
    ConnectionString(String),

    #[error("input and output queues must differ, both are `{0}`")]
    QueueCollision(String),
}

#[derive(Debug, Error)]
pub enum AgentServiceError {
    #[error("agent service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("could not acquire agent service credential: {0}")]
    Credential(String),
}

// A run ending in `failed` is not an error: it is logged and extraction still runs.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("could not create agent session: {0}")]
    SessionCreation(#[source] AgentServiceError),

    #[error("run transport failure: {0}")]
    RunTransport(#[source] AgentServiceError),

    #[error("thread `{thread_id}` holds no assistant response")]
    NoAssistantResponse { thread_id: String },

    // `run_id` is None when interrupted before the run was started.
    #[error("turn unfinished after {waited:?} (run {})", .run_id.as_deref().unwrap_or("not started"))]
    DeadlineExceeded { run_id: Option<String>, waited: Duration },

    #[error("turn cancelled by the caller (run {})", .run_id.as_deref().unwrap_or("not started"))]
    Cancelled { run_id: Option<String> },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("queue service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("could not sign queue request: {0}")]
    Signing(String),

    #[error("could not decode queue response: {0}")]
    Decode(String),
}
