//! Signal-driven comment-rate governor.
//!
//! The governor turns periodic audio analysis into a target comment rate and
//! gates each generation attempt against it. State is single-writer; the mutex
//! exists so the minute-reset ticker can roll the per-minute counter.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use murmur_schema::{AudioAnalysisData, ConversationPace, EngagementLevel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{FrequencyConfig, FrequencySample, FrequencyState, MINUTE_MS};

const SLOW_PACE_BELOW: f64 = 0.8;
const FAST_PACE_ABOVE: f64 = 1.2;

/// Activity estimate derived from the governor's recent samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Engagement {
    pub level: f64,
    pub bucket: EngagementLevel,
    pub pace: ConversationPace,
}

struct Inner {
    state: FrequencyState,
    rng: StdRng,
}

pub struct FrequencyGovernor {
    config: FrequencyConfig,
    inner: Arc<Mutex<Inner>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl FrequencyGovernor {
    pub fn new(config: FrequencyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = FrequencyState::new(&config);
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner { state, rng })),
            ticker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FrequencyConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> FrequencyState {
        self.lock().state.clone()
    }

    pub fn current_frequency(&self) -> f64 {
        self.lock().state.current_frequency
    }

    pub fn target_frequency(&self) -> f64 {
        self.lock().state.target_frequency
    }

    /// Feeds one audio analysis sample taken at `now_ms`.
    pub fn update_at(&self, data: &AudioAnalysisData, now_ms: i64) {
        let config = &self.config;
        let mut inner = self.lock();
        let state = &mut inner.state;
        state.roll_minute(now_ms);

        let target = if data.is_speaking {
            state.is_in_silence = false;
            state.silence_duration_ms = 0;
            state.silence_started_at_ms = None;
            let target = config.clamp(speaking_target(config, data));
            state.last_speaking_target = target;
            target
        } else {
            if !state.is_in_silence {
                state.is_in_silence = true;
                state.silence_started_at_ms = Some(now_ms);
            }
            let observed = state
                .silence_started_at_ms
                .map(|start| (now_ms - start).max(0) as u64)
                .unwrap_or(0);
            state.silence_duration_ms = observed.max(data.silence_duration_ms);
            config.clamp(silence_target(
                config,
                state.last_speaking_target,
                state.silence_duration_ms,
            ))
        };

        state.target_frequency = target;
        state.current_frequency = config.clamp(
            state.current_frequency * config.smoothness + target * (1.0 - config.smoothness),
        );

        let sample = FrequencySample {
            at_ms: now_ms,
            frequency: state.current_frequency,
            volume: data.volume,
            speech_rate: data.speech_rate,
            is_speaking: data.is_speaking,
        };
        state.push_sample(sample, config.history_len);

        tracing::trace!(
            target = state.target_frequency,
            current = state.current_frequency,
            silent = state.is_in_silence,
            "frequency updated"
        );
    }

    /// Decides whether a generation attempt is allowed at `now_ms`. A granted
    /// call records the comment slot.
    pub fn should_generate_at(&self, now_ms: i64) -> bool {
        let hard_floor_ms = self.config.hard_floor_ms();
        let max_per_minute = self.config.max_per_minute();
        let jitter = self.config.jitter;

        let mut inner = self.lock();
        let Inner { state, rng } = &mut *inner;
        state.roll_minute(now_ms);

        let Some(last) = state.last_comment_at_ms else {
            state.record_comment(now_ms);
            return true;
        };

        let elapsed = (now_ms - last) as f64;
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let expected_ms = 60_000.0 / state.current_frequency * factor;
        let allowed = elapsed >= expected_ms.max(hard_floor_ms)
            && state.comments_this_minute < max_per_minute;

        if allowed {
            state.record_comment(now_ms);
        }
        allowed
    }

    /// Records a comment slot without consulting the gate.
    pub fn record_comment_at(&self, now_ms: i64) {
        let mut inner = self.lock();
        inner.state.roll_minute(now_ms);
        inner.state.record_comment(now_ms);
    }

    pub fn engagement(&self) -> Engagement {
        let inner = self.lock();
        let state = &inner.state;
        let config = &self.config;

        let average_frequency = if state.adaptation_history.is_empty() {
            state.current_frequency
        } else {
            state
                .adaptation_history
                .iter()
                .map(|s| s.frequency)
                .sum::<f64>()
                / state.adaptation_history.len() as f64
        };
        let span = config.max_frequency - config.min_frequency;
        let level = if span > 0.0 {
            ((average_frequency - config.min_frequency) / span).clamp(0.0, 1.0)
        } else {
            0.5
        };
        let bucket = if level < 0.33 {
            EngagementLevel::Low
        } else if level < 0.66 {
            EngagementLevel::Medium
        } else {
            EngagementLevel::High
        };

        let speaking: Vec<f64> = state
            .adaptation_history
            .iter()
            .filter(|s| s.is_speaking)
            .map(|s| s.speech_rate / config.reference_speech_rate)
            .collect();
        let pace = if state.adaptation_history.is_empty() {
            ConversationPace::Normal
        } else if speaking.is_empty() {
            ConversationPace::Slow
        } else {
            let average = speaking.iter().sum::<f64>() / speaking.len() as f64;
            if average < SLOW_PACE_BELOW {
                ConversationPace::Slow
            } else if average > FAST_PACE_ABOVE {
                ConversationPace::Fast
            } else {
                ConversationPace::Normal
            }
        };

        Engagement {
            level,
            bucket,
            pace,
        }
    }

    /// Starts the background ticker that rolls the per-minute counter on the
    /// fixed cadence. `now_ms` supplies the clock. Replaces any running ticker.
    pub fn start_minute_reset<F>(&self, now_ms: F)
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let period = Duration::from_millis(MINUTE_MS as u64);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if guard.state.roll_minute(now_ms()) {
                    tracing::debug!("per-minute comment counter reset");
                }
            }
        });

        let mut ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = ticker.replace(handle) {
            previous.abort();
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = FrequencyState::new(&self.config);
    }

    /// Cancels the minute-reset ticker.
    pub fn dispose(&self) {
        let mut ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = ticker.take() {
            handle.abort();
        }
    }
}

impl Drop for FrequencyGovernor {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn speaking_target(config: &FrequencyConfig, data: &AudioAnalysisData) -> f64 {
    let volume_factor = (data.volume / config.reference_volume).clamp(0.5, 2.0);
    let rate_factor = (data.speech_rate / config.reference_speech_rate).clamp(0.5, 2.0);
    let variance_factor = 1.0 + (data.volume_variance.max(0.0) * config.variance_gain).min(1.0);
    config.base_frequency * volume_factor * rate_factor * variance_factor
}

fn silence_target(config: &FrequencyConfig, from: f64, silence_ms: u64) -> f64 {
    let floor = config.base_frequency * config.baseline_activity;
    let progress = if config.silence_ramp_ms == 0 {
        1.0
    } else {
        (silence_ms as f64 / config.silence_ramp_ms as f64).min(1.0)
    };
    (from - (from - floor).max(0.0) * progress).max(floor)
}
