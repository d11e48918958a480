use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the inference engine. Cloneable so a single load
/// result can be shared by every concurrent caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("model is not loaded")]
    NotLoaded,

    #[error("another inference is in flight")]
    Busy,

    #[error("inference timed out after {0} ms")]
    Timeout(u64),

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("cancelled by unload")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
