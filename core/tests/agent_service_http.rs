use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::Url;
use secrecy::SecretString;
use serde_json::json;
use skyqueue_core::agents::{AgentRequest, AgentService, HttpAgentService, Role, RunStatus};
use skyqueue_core::config::{AgentProfile, HttpSettings, QueueNames};
use skyqueue_core::credential::StaticToken;
use skyqueue_core::queue::StorageAccount;
use skyqueue_core::{AgentServiceError, ToolDescriptor};
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client(server: &MockServer) -> HttpAgentService {
    client_with(server, &HttpSettings::default())
}

fn client_with(server: &MockServer, http: &HttpSettings) -> HttpAgentService {
    let endpoint = Url::parse(&format!("{}/api/projects/demo", server.uri())).unwrap();
    HttpAgentService::new(
        &endpoint,
        "v1",
        Arc::new(StaticToken::new(SecretString::from("test-token"))),
        http,
    )
    .unwrap()
}

#[tokio::test]
async fn create_agent_sends_tool_definition_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/projects/demo/assistants"))
        .and(query_param("api-version", "v1"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "model": "gpt-4.1-mini",
            "name": "azure-function-agent-get-weather",
            "tools": [{ "type": "azure_function" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "asst_1" })))
        .expect(1)
        .mount(&server)
        .await;

    let storage = StorageAccount::parse("UseDevelopmentStorage=true").unwrap();
    let tool = ToolDescriptor::get_weather(&storage, &QueueNames::default());
    let request = AgentRequest::new(&AgentProfile::default(), std::slice::from_ref(&tool));

    let id = client(&server).await.create_agent(&request).await.unwrap();
    assert_eq!(id, "asst_1");
}

#[tokio::test]
async fn user_message_and_run_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/projects/demo/threads/t1/messages"))
        .and(body_json(json!({ "role": "user", "content": "What's the weather in Paris?" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "msg_1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/projects/demo/threads/t1/runs"))
        .and(body_json(json!({ "assistant_id": "asst_1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1", "thread_id": "t1", "status": "queued"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server).await;
    assert_eq!(
        client.create_message("t1", "What's the weather in Paris?").await.unwrap(),
        "msg_1"
    );
    let run = client.create_run("t1", "asst_1").await.unwrap();
    assert_eq!(run.id, "run_1");
    assert_eq!(run.status, RunStatus::Queued);
}

#[tokio::test]
async fn failed_run_carries_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects/demo/threads/t1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1",
            "thread_id": "t1",
            "status": "failed",
            "last_error": { "code": "server_error", "message": "tool timed out" }
        })))
        .mount(&server)
        .await;

    let run = client(&server).await.get_run("t1", "run_1").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.unwrap().to_string(), "server_error: tool timed out");
}

#[tokio::test]
async fn list_messages_follows_pages_newest_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects/demo/threads/t1/messages"))
        .and(query_param("order", "desc"))
        .and(query_param("after", "m2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "m1", "role": "user", "content": [{ "type": "text", "text": { "value": "hi", "annotations": [] } }] }
            ],
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/projects/demo/threads/t1/messages"))
        .and(query_param("order", "desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "m2", "role": "assistant", "content": [{ "type": "text", "text": { "value": "hello", "annotations": [] } }] }
            ],
            "has_more": true,
            "last_id": "m2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let messages = client(&server).await.list_messages("t1").await.unwrap();
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m2", "m1"]);
    assert_eq!(messages[0].role, Role::Assistant);
}

#[tokio::test]
async fn error_envelope_message_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/projects/demo/threads"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": "PermissionDenied", "message": "caller lacks project access" }
        })))
        .mount(&server)
        .await;

    let err = client(&server).await.create_thread().await.unwrap_err();
    assert!(matches!(
        err,
        AgentServiceError::Api { status: 403, ref message } if message == "caller lacks project access"
    ));
}

#[tokio::test]
async fn deletes_agent_and_thread() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/projects/demo/assistants/asst_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "asst_1", "deleted": true })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/projects/demo/threads/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "t1", "deleted": true })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server).await;
    client.delete_agent("asst_1").await.unwrap();
    client.delete_thread("t1").await.unwrap();
}

#[tokio::test]
async fn stalled_response_fails_after_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects/demo/threads/thread_1/runs/run_1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_json(json!({"id": "run_1", "thread_id": "thread_1", "status": "queued"})),
        )
        .mount(&server)
        .await;

    let http = HttpSettings {
        timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(200),
    };
    let started = std::time::Instant::now();
    let err = client_with(&server, &http).get_run("thread_1", "run_1").await.unwrap_err();

    assert!(matches!(err, AgentServiceError::Http(ref e) if e.is_timeout()), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}
