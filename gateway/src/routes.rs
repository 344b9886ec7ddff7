use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use skyqueue_core::Conversation;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{ApiError, PromptRequest};

const FUNCTION_KEY_HEADER: &str = "x-functions-key";

#[derive(Clone)]
pub struct AppState {
    conversation: Arc<Conversation>,
    function_key: Option<SecretString>,
}

impl AppState {
    pub fn new(conversation: Arc<Conversation>, function_key: Option<SecretString>) -> Self {
        Self { conversation, function_key }
    }
}

pub fn router(state: AppState) -> Router {
    let prompt_routes = Router::new()
        .route("/prompt", post(submit_prompt))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_function_key));

    Router::new()
        .route("/health", get(health_check))
        .merge(prompt_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- HANDLERS ---

async fn health_check() -> &'static str {
    "skyqueue gateway: operational"
}

// The turn runs on its own task: if the caller goes away the drop guard
// cancels it, and the task still tears the session down.
async fn submit_prompt(State(state): State<AppState>, body: Bytes) -> Result<String, ApiError> {
    let request: PromptRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("expected {{\"Prompt\": string}}: {e}")))?;
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("Prompt must not be empty".to_string()));
    }
    info!(chars = request.prompt.len(), "received prompt");

    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    let conversation = Arc::clone(&state.conversation);
    let turn = tokio::spawn(async move { conversation.ask(&request.prompt, &cancel).await });

    let text = turn
        .await
        .map_err(|e| ApiError::Internal(format!("turn task failed: {e}")))??;
    Ok(text)
}

// --- FUNCTION KEY ---

#[derive(Deserialize)]
struct KeyQuery {
    code: Option<String>,
}

async fn require_function_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.function_key.as_ref() else {
        return Ok(next.run(request).await);
    };

    let from_header = request
        .headers()
        .get(FUNCTION_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    // Query values arrive percent-encoded.
    let from_query = Query::<KeyQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.code);

    match from_header.or(from_query) {
        Some(given) if keys_match(&given, expected.expose_secret()) => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}

// Constant time in the key length.
fn keys_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    given.len() == expected.len()
        && given.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use skyqueue_core::agents::{
        AgentRequest, AgentService, ContentBlock, Role, Run, RunStatus, TextContent, ThreadMessage,
    };
    use skyqueue_core::config::{AgentProfile, PollPolicy, QueueNames};
    use skyqueue_core::queue::StorageAccount;
    use skyqueue_core::{AgentServiceError, Runtime, SessionFactory, SessionPolicy, ToolDescriptor};
    use tower::ServiceExt;

    use super::*;

    /// Agent service that completes every run immediately with a fixed reply.
    #[derive(Default)]
    struct CannedAgentService {
        reply: Option<String>,
        refuse_agents: bool,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentService for CannedAgentService {
        async fn create_agent(&self, _request: &AgentRequest) -> Result<String, AgentServiceError> {
            if self.refuse_agents {
                return Err(AgentServiceError::Api { status: 429, message: "quota".to_string() });
            }
            Ok("asst".to_string())
        }

        async fn delete_agent(&self, _agent_id: &str) -> Result<(), AgentServiceError> {
            Ok(())
        }

        async fn create_thread(&self) -> Result<String, AgentServiceError> {
            Ok("thread".to_string())
        }

        async fn delete_thread(&self, _thread_id: &str) -> Result<(), AgentServiceError> {
            Ok(())
        }

        async fn create_message(
            &self,
            _thread_id: &str,
            content: &str,
        ) -> Result<String, AgentServiceError> {
            self.prompts.lock().unwrap().push(content.to_string());
            Ok("msg".to_string())
        }

        async fn list_messages(
            &self,
            _thread_id: &str,
        ) -> Result<Vec<ThreadMessage>, AgentServiceError> {
            Ok(self
                .reply
                .iter()
                .map(|text| ThreadMessage {
                    id: "reply".to_string(),
                    role: Role::Assistant,
                    content: vec![ContentBlock::Text { text: TextContent { value: text.clone() } }],
                })
                .collect())
        }

        async fn create_run(&self, thread_id: &str, _agent_id: &str) -> Result<Run, AgentServiceError> {
            Ok(Run {
                id: "run".to_string(),
                thread_id: thread_id.to_string(),
                status: RunStatus::Completed,
                last_error: None,
            })
        }

        async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
            Ok(Run {
                id: run_id.to_string(),
                thread_id: thread_id.to_string(),
                status: RunStatus::Completed,
                last_error: None,
            })
        }

        async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentServiceError> {
            self.get_run(thread_id, run_id).await
        }
    }

    fn app(service: Arc<CannedAgentService>, key: Option<&str>) -> Router {
        let storage = StorageAccount::parse("UseDevelopmentStorage=true").unwrap();
        let tool = ToolDescriptor::get_weather(&storage, &QueueNames::default());
        let factory = SessionFactory::new(
            service,
            &AgentProfile::default(),
            &tool,
            SessionPolicy::PerRequest,
        )
        .unwrap();
        let conversation = Conversation::new(Arc::new(factory), Runtime::new(PollPolicy::default()));
        router(AppState::new(Arc::new(conversation), key.map(SecretString::from)))
    }

    fn post_prompt(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = app(Arc::default(), Some("k"))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prompt_returns_assistant_text() {
        let service = Arc::new(CannedAgentService {
            reply: Some("Weather is 74 degrees and sunny in Paris".to_string()),
            ..Default::default()
        });

        let response = app(service.clone(), None)
            .oneshot(post_prompt("/prompt", r#"{"Prompt":"What's the weather in Paris?"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Weather is 74 degrees and sunny in Paris");
        assert_eq!(
            service.prompts.lock().unwrap().clone(),
            vec!["What's the weather in Paris?".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_prompt_field_is_bad_request() {
        let response = app(Arc::default(), None)
            .oneshot(post_prompt("/prompt", r#"{"prompt":"lowercase key"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected_before_any_session_is_opened() {
        let service = Arc::new(CannedAgentService::default());
        let response = app(service.clone(), None)
            .oneshot(post_prompt("/prompt", r#"{"Prompt":"   "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(service.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_assistant_reply_is_bad_gateway_not_placeholder() {
        let response = app(Arc::default(), None)
            .oneshot(post_prompt("/prompt", r#"{"Prompt":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("no assistant response"));
    }

    #[tokio::test]
    async fn session_creation_failure_is_service_unavailable() {
        let service = Arc::new(CannedAgentService { refuse_agents: true, ..Default::default() });
        let response = app(service, None)
            .oneshot(post_prompt("/prompt", r#"{"Prompt":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn function_key_is_enforced_on_prompt() {
        let service = Arc::new(CannedAgentService {
            reply: Some("ok".to_string()),
            ..Default::default()
        });

        let denied = app(service.clone(), Some("secret"))
            .oneshot(post_prompt("/prompt", r#"{"Prompt":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut with_header = post_prompt("/prompt", r#"{"Prompt":"hi"}"#);
        with_header.headers_mut().insert(FUNCTION_KEY_HEADER, "secret".parse().unwrap());
        let allowed = app(service.clone(), Some("secret")).oneshot(with_header).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let allowed = app(service, Some("secret"))
            .oneshot(post_prompt("/prompt?code=secret", r#"{"Prompt":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn query_key_is_percent_decoded() {
        let service = Arc::new(CannedAgentService {
            reply: Some("ok".to_string()),
            ..Default::default()
        });
        let key = "ab/cd+ef==";

        let allowed = app(service.clone(), Some(key))
            .oneshot(post_prompt("/prompt?code=ab%2Fcd%2Bef%3D%3D", r#"{"Prompt":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let denied = app(service, Some(key))
            .oneshot(post_prompt("/prompt?code=ab%2Fcd%2Bef%3D", r#"{"Prompt":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn key_comparison_requires_exact_match() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secreT"));
        assert!(!keys_match("secre", "secret"));
        assert!(!keys_match("", "secret"));
    }
}
