pub mod ollama;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::OllamaRuntime;

/// Factory for model resources. Construction may be slow (weights download,
/// warm-up) and is expected to run on the inference worker.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn create_engine(&self, model_id: &str) -> Result<Box<dyn EngineHandle>>;
}

/// A constructed model resource. Owned exclusively by one worker task.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    async fn reload(&mut self) -> Result<()> {
        Ok(())
    }

    async fn unload(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// Runtime Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// In-process canned replies; no model is downloaded.
    #[default]
    Stub,
    Ollama,
    /// No model runtime; the engine always fails to load.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(rename = "type", default)]
    pub runtime_type: RuntimeType,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: RuntimeType::default(),
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Create a model runtime from configuration.
pub fn create_runtime(config: &RuntimeConfig) -> Result<Arc<dyn ModelRuntime>> {
    let runtime: Arc<dyn ModelRuntime> = match config.runtime_type {
        RuntimeType::Stub => Arc::new(StubRuntime::default()),
        RuntimeType::Ollama => {
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or("http://localhost:11434");
            Arc::new(OllamaRuntime::new(
                base_url,
                Duration::from_secs(config.request_timeout_secs),
            ))
        }
        RuntimeType::Disabled => Arc::new(DisabledRuntime),
    };
    tracing::info!(runtime = ?config.runtime_type, "model runtime configured");
    Ok(runtime)
}

pub struct DisabledRuntime;

#[async_trait]
impl ModelRuntime for DisabledRuntime {
    async fn create_engine(&self, model_id: &str) -> Result<Box<dyn EngineHandle>> {
        Err(anyhow!("model runtime disabled; cannot load {model_id}"))
    }
}

// ============================================================
// Stub Runtime
// ============================================================

#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub load_delay: Duration,
    /// Number of initial `create_engine` calls that fail.
    pub failing_loads: usize,
    pub reply_delay: Duration,
    pub replies: Vec<String>,
    pub fail_completions: bool,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            load_delay: Duration::ZERO,
            failing_loads: 0,
            reply_delay: Duration::ZERO,
            replies: vec!["いいね！".to_string()],
            fail_completions: false,
        }
    }
}

#[derive(Default)]
pub struct StubRuntime {
    behavior: StubBehavior,
    constructions: Arc<AtomicUsize>,
    attempts: AtomicUsize,
}

impl StubRuntime {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            constructions: Arc::new(AtomicUsize::new(0)),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of successfully constructed engine handles.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Number of `create_engine` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelRuntime for StubRuntime {
    async fn create_engine(&self, model_id: &str) -> Result<Box<dyn EngineHandle>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.load_delay.is_zero() {
            tokio::time::sleep(self.behavior.load_delay).await;
        }
        if attempt < self.behavior.failing_loads {
            anyhow::bail!("stub load failure #{} for {model_id}", attempt + 1);
        }
        self.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubEngine {
            model_id: model_id.to_string(),
            behavior: self.behavior.clone(),
            cursor: AtomicUsize::new(0),
            reloads: 0,
        }))
    }
}

struct StubEngine {
    model_id: String,
    behavior: StubBehavior,
    cursor: AtomicUsize,
    reloads: u32,
}

#[async_trait]
impl EngineHandle for StubEngine {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if !self.behavior.reply_delay.is_zero() {
            tokio::time::sleep(self.behavior.reply_delay).await;
        }
        if self.behavior.fail_completions {
            anyhow::bail!("stub completion failure ({})", self.model_id);
        }
        if self.behavior.replies.is_empty() {
            return Ok(format!("[stub:{}] {}", self.model_id, prompt.lines().last().unwrap_or("")));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.behavior.replies.len();
        Ok(self.behavior.replies[idx].clone())
    }

    async fn reload(&mut self) -> Result<()> {
        self.reloads += 1;
        tracing::debug!(model = %self.model_id, reloads = self.reloads, "stub engine reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_runtime_counts_constructions() {
        let runtime = StubRuntime::default();
        let engine = runtime.create_engine("tiny").await.unwrap();
        assert_eq!(runtime.constructions(), 1);
        assert_eq!(engine.complete("hello").await.unwrap(), "いいね！");
    }

    #[tokio::test]
    async fn stub_runtime_fails_initial_loads() {
        let runtime = StubRuntime::new(StubBehavior {
            failing_loads: 1,
            ..StubBehavior::default()
        });
        assert!(runtime.create_engine("tiny").await.is_err());
        assert!(runtime.create_engine("tiny").await.is_ok());
        assert_eq!(runtime.attempts(), 2);
        assert_eq!(runtime.constructions(), 1);
    }

    #[tokio::test]
    async fn stub_engine_cycles_replies() {
        let runtime = StubRuntime::new(StubBehavior {
            replies: vec!["a".into(), "b".into()],
            ..StubBehavior::default()
        });
        let engine = runtime.create_engine("tiny").await.unwrap();
        assert_eq!(engine.complete("x").await.unwrap(), "a");
        assert_eq!(engine.complete("x").await.unwrap(), "b");
        assert_eq!(engine.complete("x").await.unwrap(), "a");
    }

    #[tokio::test]
    async fn stub_engine_echoes_without_replies() {
        let runtime = StubRuntime::new(StubBehavior {
            replies: vec![],
            ..StubBehavior::default()
        });
        let engine = runtime.create_engine("tiny").await.unwrap();
        let out = engine.complete("role: reaction\nすごい").await.unwrap();
        assert_eq!(out, "[stub:tiny] すごい");
    }

    #[tokio::test]
    async fn disabled_runtime_never_loads() {
        let runtime = create_runtime(&RuntimeConfig {
            runtime_type: RuntimeType::Disabled,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let err = runtime.create_engine("any").await.err().unwrap();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn runtime_config_deserializes_with_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"type":"ollama"}"#).unwrap();
        assert_eq!(config.runtime_type, RuntimeType::Ollama);
        assert_eq!(config.base_url, None);
        assert_eq!(config.request_timeout_secs, 30);
    }
}
