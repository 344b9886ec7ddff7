use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Tool call the agent service drops on the input queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub location: String,
    #[serde(
        rename = "CorrelationId",
        alias = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

/// Reply published on the output queue; the agent service matches it to the
/// pending call by correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "CorrelationId")]
    pub correlation_id: String,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed queue message: {0}")]
    MalformedQueueMessage(String),
}

/// Produces the weather sentence for a location.
pub trait WeatherSource: Send + Sync {
    fn describe(&self, location: &str) -> String;
}

/// Canned answer used until a real forecast backend is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockWeather;

impl WeatherSource for MockWeather {
    fn describe(&self, location: &str) -> String {
        format!("Weather is 74 degrees and sunny in {location}")
    }
}

/// Decodes a raw request body, computes the answer and builds the reply.
pub fn handle(body: &[u8], weather: &dyn WeatherSource) -> Result<ToolResponse, HandlerError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| HandlerError::MalformedQueueMessage(format!("body is not UTF-8: {e}")))?;
    let request: ToolRequest = serde_json::from_str(text)
        .map_err(|e| HandlerError::MalformedQueueMessage(e.to_string()))?;

    let correlation_id = request
        .correlation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(ToolResponse {
        value: weather.describe(&request.location),
        correlation_id,
    })
}
