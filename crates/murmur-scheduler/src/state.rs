use std::collections::VecDeque;

use serde::Serialize;

use crate::FrequencyConfig;

pub const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrequencySample {
    pub at_ms: i64,
    pub frequency: f64,
    pub volume: f64,
    pub speech_rate: f64,
    pub is_speaking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencyState {
    pub current_frequency: f64,
    pub target_frequency: f64,
    /// Target in effect when speech last stopped; silence decays from here.
    pub last_speaking_target: f64,
    pub last_comment_at_ms: Option<i64>,
    pub comments_this_minute: u32,
    pub minute_started_at_ms: Option<i64>,
    pub adaptation_history: VecDeque<FrequencySample>,
    pub is_in_silence: bool,
    pub silence_duration_ms: u64,
    pub silence_started_at_ms: Option<i64>,
}

impl FrequencyState {
    pub fn new(config: &FrequencyConfig) -> Self {
        let base = config.clamp(config.base_frequency);
        Self {
            current_frequency: base,
            target_frequency: base,
            last_speaking_target: base,
            last_comment_at_ms: None,
            comments_this_minute: 0,
            minute_started_at_ms: None,
            adaptation_history: VecDeque::with_capacity(config.history_len),
            is_in_silence: false,
            silence_duration_ms: 0,
            silence_started_at_ms: None,
        }
    }

    /// Advances the minute window on its fixed cadence. Returns true when the
    /// per-minute counter was reset.
    pub fn roll_minute(&mut self, now_ms: i64) -> bool {
        let Some(anchor) = self.minute_started_at_ms else {
            self.minute_started_at_ms = Some(now_ms);
            return false;
        };
        if now_ms - anchor < MINUTE_MS {
            return false;
        }
        let elapsed_minutes = (now_ms - anchor) / MINUTE_MS;
        self.minute_started_at_ms = Some(anchor + elapsed_minutes * MINUTE_MS);
        self.comments_this_minute = 0;
        true
    }

    pub fn record_comment(&mut self, now_ms: i64) {
        self.last_comment_at_ms = Some(now_ms);
        self.comments_this_minute = self.comments_this_minute.saturating_add(1);
    }

    pub fn push_sample(&mut self, sample: FrequencySample, capacity: usize) {
        while self.adaptation_history.len() >= capacity {
            self.adaptation_history.pop_front();
        }
        self.adaptation_history.push_back(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at_ms: i64) -> FrequencySample {
        FrequencySample {
            at_ms,
            frequency: 8.0,
            volume: 0.5,
            speech_rate: 1.0,
            is_speaking: true,
        }
    }

    #[test]
    fn minute_rolls_on_fixed_cadence() {
        let mut state = FrequencyState::new(&FrequencyConfig::default());
        assert!(!state.roll_minute(1_000));
        state.record_comment(1_000);
        state.record_comment(2_000);
        assert!(!state.roll_minute(60_999));
        assert_eq!(state.comments_this_minute, 2);

        assert!(state.roll_minute(61_000));
        assert_eq!(state.comments_this_minute, 0);
        assert_eq!(state.minute_started_at_ms, Some(61_000));

        // Skipped minutes keep the anchor aligned to the original cadence.
        assert!(state.roll_minute(61_000 + 3 * MINUTE_MS + 5));
        assert_eq!(state.minute_started_at_ms, Some(61_000 + 3 * MINUTE_MS));
    }

    #[test]
    fn history_is_a_ring_buffer() {
        let mut state = FrequencyState::new(&FrequencyConfig::default());
        for i in 0..100 {
            state.push_sample(sample(i), 60);
        }
        assert_eq!(state.adaptation_history.len(), 60);
        assert_eq!(state.adaptation_history.front().unwrap().at_ms, 40);
    }
}
