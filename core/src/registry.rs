use serde::Serialize;
use serde_json::{json, Value};

use crate::config::QueueNames;
use crate::error::ConfigError;
use crate::queue::StorageAccount;

pub const GET_WEATHER: &str = "GetWeather";

/// One queue the agent service reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueBinding {
    pub queue_name: String,
    #[serde(rename = "queue_service_endpoint")]
    pub service_endpoint: String,
}

/// A single typed parameter of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: String,
    pub description: String,
}

/// Object-shaped JSON schema the agent fills in when it calls the tool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterSchema {
    pub properties: Vec<ParameterSpec>,
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn property(mut self, name: &str, kind: &str, description: &str, required: bool) -> Self {
        self.properties.push(ParameterSpec {
            name: name.to_string(),
            kind: kind.to_string(),
            description: description.to_string(),
        });
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn to_json(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .properties
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    json!({ "type": p.kind, "description": p.description }),
                )
            })
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }
}

/// Static declaration of an external capability reachable through a queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
    pub input_queue: QueueBinding,
    pub output_queue: QueueBinding,
}

impl ToolDescriptor {
    /// The weather lookup tool, bound to the given queues of one storage account.
    pub fn get_weather(storage: &StorageAccount, queues: &QueueNames) -> Self {
        let endpoint = storage.queue_endpoint().to_string();
        Self {
            name: GET_WEATHER.to_string(),
            description: "Get the weather in a location.".to_string(),
            parameters: ParameterSchema::default().property(
                "location",
                "string",
                "The location to look up.",
                true,
            ),
            input_queue: QueueBinding {
                queue_name: queues.input.clone(),
                service_endpoint: endpoint.clone(),
            },
            output_queue: QueueBinding {
                queue_name: queues.output.clone(),
                service_endpoint: endpoint,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "tool.name",
                reason: "tool name is empty".to_string(),
            });
        }
        for binding in [&self.input_queue, &self.output_queue] {
            if binding.queue_name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "tool.queue",
                    reason: format!("tool `{}` has an unnamed queue", self.name),
                });
            }
        }
        if self.input_queue.queue_name == self.output_queue.queue_name {
            return Err(ConfigError::QueueCollision(self.input_queue.queue_name.clone()));
        }
        if self.input_queue.service_endpoint != self.output_queue.service_endpoint {
            return Err(ConfigError::Invalid {
                key: "tool.queue",
                reason: "input and output queues live in different storage accounts".to_string(),
            });
        }
        if let Some(missing) = self
            .parameters
            .required
            .iter()
            .find(|r| !self.parameters.properties.iter().any(|p| &p.name == *r))
        {
            return Err(ConfigError::Invalid {
                key: "tool.parameters",
                reason: format!("required parameter `{missing}` is not declared"),
            });
        }
        Ok(())
    }

    /// Tool definition in the shape the agent service expects on agent creation.
    pub fn definition(&self) -> Value {
        json!({
            "type": "azure_function",
            "azure_function": {
                "function": {
                    "name": self.name,
                    "description": self.description,
                    "parameters": self.parameters.to_json(),
                },
                "input_binding": {
                    "type": "storage_queue",
                    "storage_queue": self.input_queue,
                },
                "output_binding": {
                    "type": "storage_queue",
                    "storage_queue": self.output_queue,
                },
            }
        })
    }
}
