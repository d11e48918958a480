//! Local model runtime backed by an Ollama server.
//!
//! `create_engine` checks that the requested model is installed; completions
//! use the non-streaming `/api/generate` endpoint.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{EngineHandle, ModelRuntime};

#[derive(Debug, Clone)]
pub struct OllamaRuntime {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaRuntime {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

fn model_matches(installed: &str, requested: &str) -> bool {
    installed == requested
        || installed
            .strip_suffix(":latest")
            .is_some_and(|base| base == requested)
}

#[async_trait]
impl ModelRuntime for OllamaRuntime {
    async fn create_engine(&self, model_id: &str) -> Result<Box<dyn EngineHandle>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("ollama unreachable: {e}"))?;
        if resp.status() != StatusCode::OK {
            return Err(anyhow!("ollama tags request failed ({})", resp.status()));
        }
        let tags: TagsResponse = resp.json().await?;
        if !tags.models.iter().any(|m| model_matches(&m.name, model_id)) {
            return Err(anyhow!("model {model_id} is not installed on the ollama server"));
        }

        tracing::info!(model = %model_id, base_url = %self.base_url, "ollama engine ready");
        Ok(Box::new(OllamaEngine {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model_id: model_id.to_string(),
        }))
    }
}

struct OllamaEngine {
    client: reqwest::Client,
    base_url: String,
    model_id: String,
}

impl OllamaEngine {
    async fn generate(&self, prompt: &str, keep_alive: Option<i64>) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let payload = GenerateRequest {
            model: &self.model_id,
            prompt,
            stream: false,
            keep_alive,
        };
        let resp = match self.client.post(url).json(&payload).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(anyhow!("ollama request timed out")),
            Err(e) => return Err(e.into()),
        };
        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ollama generate failed ({status}): {text}"));
        }
        let body: GenerateResponse = resp.json().await?;
        Ok(body.response)
    }
}

#[async_trait]
impl EngineHandle for OllamaEngine {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.generate(prompt, None).await
    }

    async fn reload(&mut self) -> Result<()> {
        // An empty prompt makes the server (re)load the model into memory.
        self.generate("", None).await.map(|_| ())
    }

    async fn unload(&mut self) -> Result<()> {
        self.generate("", Some(0)).await.map(|_| ())
    }
}
