use std::time::Duration;

use murmur_provider::{ModelRuntime, OllamaRuntime};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_tags(server: &MockServer, names: &[&str]) {
    let models: Vec<_> = names
        .iter()
        .map(|name| serde_json::json!({ "name": name }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "models": models })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn create_engine_and_complete() {
    let server = MockServer::start().await;
    mount_tags(&server, &["qwen2.5:0.5b"]).await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({
            "model": "qwen2.5:0.5b",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "qwen2.5:0.5b",
            "response": "それな！",
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let runtime = OllamaRuntime::new(server.uri(), Duration::from_secs(5));
    let engine = runtime.create_engine("qwen2.5:0.5b").await.unwrap();
    let text = engine.complete("say something").await.unwrap();
    assert_eq!(text, "それな！");
}

#[tokio::test]
async fn create_engine_fails_for_missing_model() {
    let server = MockServer::start().await;
    mount_tags(&server, &["llama3:latest"]).await;

    let runtime = OllamaRuntime::new(server.uri(), Duration::from_secs(5));
    let err = runtime.create_engine("qwen2.5:0.5b").await.err().unwrap();
    assert!(err.to_string().contains("not installed"));
}

#[tokio::test]
async fn create_engine_fails_when_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let runtime = OllamaRuntime::new(server.uri(), Duration::from_secs(5));
    let err = runtime.create_engine("llama3").await.err().unwrap();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn complete_surfaces_generate_errors() {
    let server = MockServer::start().await;
    mount_tags(&server, &["llama3:latest"]).await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;

    let runtime = OllamaRuntime::new(server.uri(), Duration::from_secs(5));
    let engine = runtime.create_engine("llama3").await.unwrap();
    let err = engine.complete("hi").await.err().unwrap();
    assert!(err.to_string().contains("model crashed"));
}
