use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Tuning for the comment-rate governor. Frequencies are in comments per minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyConfig {
    #[serde(default = "default_base_frequency")]
    pub base_frequency: f64,
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f64,
    #[serde(default = "default_max_frequency")]
    pub max_frequency: f64,
    /// Weight of the previous value in the current-frequency EMA.
    #[serde(default = "default_smoothness")]
    pub smoothness: f64,
    #[serde(default = "default_reference_volume")]
    pub reference_volume: f64,
    #[serde(default = "default_reference_speech_rate")]
    pub reference_speech_rate: f64,
    #[serde(default = "default_variance_gain")]
    pub variance_gain: f64,
    /// Fraction of the base frequency kept alive during long silences.
    #[serde(default = "default_baseline_activity")]
    pub baseline_activity: f64,
    #[serde(default = "default_silence_ramp_ms")]
    pub silence_ramp_ms: u64,
    /// Relative spread applied to the expected interval between comments.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            base_frequency: default_base_frequency(),
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            smoothness: default_smoothness(),
            reference_volume: default_reference_volume(),
            reference_speech_rate: default_reference_speech_rate(),
            variance_gain: default_variance_gain(),
            baseline_activity: default_baseline_activity(),
            silence_ramp_ms: default_silence_ramp_ms(),
            jitter: default_jitter(),
            history_len: default_history_len(),
            seed: None,
        }
    }
}

impl FrequencyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_frequency > 0.0) {
            return Err(anyhow!("min_frequency must be positive"));
        }
        if self.max_frequency < self.min_frequency {
            return Err(anyhow!(
                "max_frequency ({}) must not be below min_frequency ({})",
                self.max_frequency,
                self.min_frequency
            ));
        }
        if !(0.0..1.0).contains(&self.smoothness) {
            return Err(anyhow!("smoothness must be in [0, 1)"));
        }
        if !(self.reference_volume > 0.0) || !(self.reference_speech_rate > 0.0) {
            return Err(anyhow!("reference volume and speech rate must be positive"));
        }
        if !(0.0..=1.0).contains(&self.baseline_activity) {
            return Err(anyhow!("baseline_activity must be in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(anyhow!("jitter must be in [0, 1)"));
        }
        if self.history_len == 0 {
            return Err(anyhow!("history_len must be at least 1"));
        }
        Ok(())
    }

    pub fn clamp(&self, frequency: f64) -> f64 {
        frequency.clamp(self.min_frequency, self.max_frequency)
    }

    /// Shortest allowed gap between two granted comments. Spaced at least
    /// this far apart, no 60 s window holds more than `max_per_minute` grants.
    pub fn hard_floor_ms(&self) -> f64 {
        60_000.0 / self.max_frequency.min(self.max_per_minute() as f64)
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_frequency.floor().max(1.0) as u32
    }
}

fn default_base_frequency() -> f64 {
    8.0
}

fn default_min_frequency() -> f64 {
    1.0
}

fn default_max_frequency() -> f64 {
    20.0
}

fn default_smoothness() -> f64 {
    0.8
}

fn default_reference_volume() -> f64 {
    0.5
}

fn default_reference_speech_rate() -> f64 {
    1.0
}

fn default_variance_gain() -> f64 {
    2.0
}

fn default_baseline_activity() -> f64 {
    0.4
}

fn default_silence_ramp_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.25
}

fn default_history_len() -> usize {
    60
}
