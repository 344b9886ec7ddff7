use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use tracing::Level;

use crate::error::ConfigError;
use crate::queue::{MessageEncoding, StorageAccount};
use crate::session::SessionPolicy;

pub const DEFAULT_INPUT_QUEUE: &str = "getweather-input";
pub const DEFAULT_OUTPUT_QUEUE: &str = "getweather-output";

const DEFAULT_MODEL: &str = "gpt-4.1-mini";
const DEFAULT_AGENT_NAME: &str = "azure-function-agent-get-weather";
const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful support agent. Answer the user's questions to the best of your ability.";

/// Everything the gateway and the worker read from the environment.
#[derive(Clone, Debug)]
pub struct Settings {
    pub project_endpoint: Url,
    pub api_version: String,
    pub access_token: Option<SecretString>,
    pub storage: StorageAccount,
    pub agent: AgentProfile,
    pub queues: QueueNames,
    pub encoding: MessageEncoding,
    pub poll: PollPolicy,
    pub session_policy: SessionPolicy,
    pub server: ServerSettings,
    pub worker: WorkerSettings,
    pub http: HttpSettings,
    pub log_level: Level,
}

/// How the remote agent is registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentProfile {
    pub model: String,
    pub name: String,
    pub instructions: String,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            name: DEFAULT_AGENT_NAME.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueNames {
    pub input: String,
    pub output: String,
}

impl QueueNames {
    /// Where the worker parks messages it gave up on.
    pub fn poison(&self) -> String {
        format!("{}-poison", self.input)
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT_QUEUE.to_string(),
            output: DEFAULT_OUTPUT_QUEUE.to_string(),
        }
    }
}

/// Cadence and upper bound of the run status poll loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Per-request limits for the outbound HTTP clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpSettings {
    pub fn client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
    }
}

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub bind_address: String,
    pub function_key: Option<SecretString>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_dequeue_count: u32,
    pub visibility_timeout: Duration,
    pub base_idle_poll: Duration,
    pub max_idle_poll: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_dequeue_count: 5,
            visibility_timeout: Duration::from_secs(30),
            base_idle_poll: Duration::from_millis(100),
            max_idle_poll: Duration::from_secs(60),
        }
    }
}

impl Settings {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let endpoint = var("PROJECT_ENDPOINT").ok_or(ConfigError::Missing("PROJECT_ENDPOINT"))?;
        let project_endpoint = Url::parse(&endpoint).map_err(|e| ConfigError::Invalid {
            key: "PROJECT_ENDPOINT",
            reason: e.to_string(),
        })?;

        let connection =
            var("STORAGE_CONNECTION").ok_or(ConfigError::Missing("STORAGE_CONNECTION"))?;
        let storage = StorageAccount::parse(&connection)?;

        let agent_defaults = AgentProfile::default();
        let agent = AgentProfile {
            model: var("AGENT_MODEL").unwrap_or(agent_defaults.model),
            name: var("AGENT_NAME").unwrap_or(agent_defaults.name),
            instructions: var("AGENT_INSTRUCTIONS").unwrap_or(agent_defaults.instructions),
        };

        let queue_defaults = QueueNames::default();
        let queues = QueueNames {
            input: var("INPUT_QUEUE").unwrap_or(queue_defaults.input),
            output: var("OUTPUT_QUEUE").unwrap_or(queue_defaults.output),
        };
        if queues.input == queues.output {
            return Err(ConfigError::QueueCollision(queues.input));
        }

        let poll_defaults = PollPolicy::default();
        let poll = PollPolicy {
            interval: parse_or(&var, "POLL_INTERVAL_MS", poll_defaults.interval, Duration::from_millis)?,
            deadline: parse_or(&var, "RUN_DEADLINE_SECS", poll_defaults.deadline, Duration::from_secs)?,
        };
        if poll.interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_MS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let worker_defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            max_dequeue_count: parse_or(
                &var,
                "MAX_DEQUEUE_COUNT",
                worker_defaults.max_dequeue_count,
                |n: u32| n,
            )?,
            visibility_timeout: parse_or(
                &var,
                "VISIBILITY_TIMEOUT_SECS",
                worker_defaults.visibility_timeout,
                Duration::from_secs,
            )?,
            base_idle_poll: worker_defaults.base_idle_poll,
            max_idle_poll: parse_or(
                &var,
                "MAX_IDLE_POLL_MS",
                worker_defaults.max_idle_poll,
                Duration::from_millis,
            )?,
        };

        let http_defaults = HttpSettings::default();
        let http = HttpSettings {
            timeout: parse_or(&var, "HTTP_TIMEOUT_SECS", http_defaults.timeout, Duration::from_secs)?,
            connect_timeout: parse_or(
                &var,
                "HTTP_CONNECT_TIMEOUT_SECS",
                http_defaults.connect_timeout,
                Duration::from_secs,
            )?,
        };
        if http.timeout.is_zero() || http.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "HTTP_TIMEOUT_SECS",
                reason: "timeouts must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            project_endpoint,
            api_version: var("AGENTS_API_VERSION").unwrap_or_else(|| "v1".to_string()),
            access_token: var("PROJECT_ACCESS_TOKEN").map(SecretString::from),
            storage,
            agent,
            queues,
            encoding: parse_or(&var, "QUEUE_MESSAGE_ENCODING", MessageEncoding::Base64, |e: MessageEncoding| e)?,
            poll,
            session_policy: parse_or(&var, "SESSION_POLICY", SessionPolicy::PerRequest, |p: SessionPolicy| p)?,
            server: ServerSettings {
                bind_address: var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
                function_key: var("FUNCTION_KEY").map(SecretString::from),
            },
            worker,
            http,
            log_level: parse_or(&var, "LOG_LEVEL", Level::INFO, |l: Level| l)?,
        })
    }
}

fn parse_or<T, U, V>(
    var: &V,
    key: &'static str,
    default: U,
    map: impl Fn(T) -> U,
) -> Result<U, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map(map).map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("`{raw}`: {e}"),
        }),
    }
}
