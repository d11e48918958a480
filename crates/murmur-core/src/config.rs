use std::fs;
use std::path::{Path, PathBuf};

use murmur_provider::RuntimeConfig;
use murmur_scheduler::FrequencyConfig;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MurmurConfig {
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub pickup: PickupConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Greetings stay eligible this long into a session.
    #[serde(default = "default_greeting_window_ms")]
    pub greeting_window_ms: u64,
    /// Departures become eligible once a session has run this long.
    #[serde(default = "default_departure_after_ms")]
    pub departure_after_ms: u64,
    #[serde(default = "default_insider_min_history")]
    pub insider_min_history: usize,
    #[serde(default = "default_pattern_boost")]
    pub pattern_boost: f64,
    #[serde(default = "default_recent_templates")]
    pub recent_templates: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            greeting_window_ms: default_greeting_window_ms(),
            departure_after_ms: default_departure_after_ms(),
            insider_min_history: default_insider_min_history(),
            pattern_boost: default_pattern_boost(),
            recent_templates: default_recent_templates(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerConfig {
    #[serde(default = "default_initial_ratio")]
    pub initial_ratio: f64,
    #[serde(default = "default_ratio_floor")]
    pub ratio_floor: f64,
    #[serde(default = "default_ratio_ceiling")]
    pub ratio_ceiling: f64,
    /// EMA step applied to the ratio after each model attempt.
    #[serde(default = "default_adapt_rate")]
    pub adapt_rate: f64,
    #[serde(default = "default_slow_latency_ms")]
    pub slow_latency_ms: u64,
    #[serde(default = "default_max_comment_chars")]
    pub max_comment_chars: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            initial_ratio: default_initial_ratio(),
            ratio_floor: default_ratio_floor(),
            ratio_ceiling: default_ratio_ceiling(),
            adapt_rate: default_adapt_rate(),
            slow_latency_ms: default_slow_latency_ms(),
            max_comment_chars: default_max_comment_chars(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_infer_timeout_ms")]
    pub infer_timeout_ms: u64,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            infer_timeout_ms: default_infer_timeout_ms(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// Multiplier applied to click strength.
    #[serde(default = "default_click_factor")]
    pub click_factor: f64,
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_topic_limit")]
    pub topic_limit: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            click_factor: default_click_factor(),
            persist_attempts: default_persist_attempts(),
            history_limit: default_history_limit(),
            topic_limit: default_topic_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupConfig {
    #[serde(default = "default_pickup_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for PickupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_pickup_window_ms(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Concurrent `generate_comment` calls admitted per session; extra calls are skipped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            ledger_capacity: default_ledger_capacity(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. In-memory storage when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl MurmurConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frequency
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("frequency: {e}")))?;

        let mixer = &self.mixer;
        if !(mixer.ratio_floor > 0.0) || mixer.ratio_floor > mixer.ratio_ceiling {
            return Err(ConfigError::Invalid(format!(
                "mixer: need 0 < ratio_floor <= ratio_ceiling, got {} and {}",
                mixer.ratio_floor, mixer.ratio_ceiling
            )));
        }
        if mixer.ratio_ceiling > 1.0 {
            return Err(ConfigError::Invalid(
                "mixer: ratio_ceiling must not exceed 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&mixer.adapt_rate) {
            return Err(ConfigError::Invalid(
                "mixer: adapt_rate must be in [0, 1]".into(),
            ));
        }
        if mixer.max_comment_chars == 0 {
            return Err(ConfigError::Invalid(
                "mixer: max_comment_chars must be positive".into(),
            ));
        }

        let learning = &self.learning;
        if learning.min_weight < 0.0 || learning.min_weight > learning.max_weight {
            return Err(ConfigError::Invalid(format!(
                "learning: need 0 <= min_weight <= max_weight, got {} and {}",
                learning.min_weight, learning.max_weight
            )));
        }
        if !(learning.min_weight..=learning.max_weight).contains(&1.0) {
            return Err(ConfigError::Invalid(
                "learning: the default weight 1.0 must lie within the weight bounds".into(),
            ));
        }
        if learning.learning_rate <= 0.0 {
            return Err(ConfigError::Invalid(
                "learning: learning_rate must be positive".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.pickup.min_confidence) {
            return Err(ConfigError::Invalid(
                "pickup: min_confidence must be in [0, 1]".into(),
            ));
        }
        if self.session.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "session: queue_depth must be at least 1".into(),
            ));
        }
        if self.selector.pattern_boost < 1.0 {
            return Err(ConfigError::Invalid(
                "selector: pattern_boost must be at least 1".into(),
            ));
        }
        if self.engine.model_id.trim().is_empty() {
            return Err(ConfigError::Invalid("engine: model_id is empty".into()));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<MurmurConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&content).map_err(|err| match err {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;
    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

pub fn parse_config(yaml: &str) -> Result<MurmurConfig, ConfigError> {
    // An empty document means "all defaults".
    let config: MurmurConfig = if yaml.trim().is_empty() {
        MurmurConfig::default()
    } else {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?
    };
    config.validate()?;
    Ok(config)
}

fn default_greeting_window_ms() -> u64 {
    60_000
}

fn default_departure_after_ms() -> u64 {
    60 * 60_000
}

fn default_insider_min_history() -> usize {
    5
}

fn default_pattern_boost() -> f64 {
    3.0
}

fn default_recent_templates() -> usize {
    10
}

fn default_initial_ratio() -> f64 {
    0.5
}

fn default_ratio_floor() -> f64 {
    0.05
}

fn default_ratio_ceiling() -> f64 {
    0.8
}

fn default_adapt_rate() -> f64 {
    0.2
}

fn default_slow_latency_ms() -> u64 {
    2_000
}

fn default_max_comment_chars() -> usize {
    60
}

fn default_model_id() -> String {
    "gemma3:1b".to_string()
}

fn default_infer_timeout_ms() -> u64 {
    3_000
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_min_weight() -> f64 {
    0.1
}

fn default_max_weight() -> f64 {
    3.0
}

fn default_click_factor() -> f64 {
    0.5
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_history_limit() -> usize {
    200
}

fn default_topic_limit() -> usize {
    20
}

fn default_pickup_window_ms() -> u64 {
    15_000
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_queue_depth() -> usize {
    2
}

fn default_ledger_capacity() -> usize {
    512
}

fn default_history_window() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_provider::RuntimeType;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.learning.learning_rate, 0.1);
        assert_eq!(config.pickup.window_ms, 15_000);
        assert_eq!(config.frequency.base_frequency, 8.0);
        assert_eq!(config.engine.runtime.runtime_type, RuntimeType::Stub);
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
learning:
  learning_rate: 0.2
engine:
  model_id: qwen2.5:0.5b
  runtime:
    type: ollama
    base_url: http://127.0.0.1:11434
storage:
  path: /tmp/murmur.db
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.learning.learning_rate, 0.2);
        assert_eq!(config.learning.max_weight, 3.0);
        assert_eq!(config.engine.model_id, "qwen2.5:0.5b");
        assert_eq!(config.engine.runtime.runtime_type, RuntimeType::Ollama);
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/murmur.db")));
    }

    #[test]
    fn invalid_ratio_bounds_are_rejected() {
        let yaml = "mixer:\n  ratio_floor: 0.0\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn weight_bounds_must_contain_default() {
        let yaml = "learning:\n  min_weight: 1.5\n  max_weight: 2.0\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        assert!(matches!(
            parse_config("learning: [1, 2"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.yaml");
        std::fs::write(&path, "session:\n  queue_depth: 4\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.session.queue_depth, 4);
    }
}
