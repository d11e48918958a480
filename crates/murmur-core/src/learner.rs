//! Per-user role weights learned from explicit and implicit feedback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use murmur_bus::BusPublisher;
use murmur_memory::PreferenceStore;
use murmur_scheduler::persist_backoff_ms;
use murmur_schema::{
    BusMessage, Capability, InteractionEvent, InteractionType, RoleType, RoleWeights,
    UserPreferenceRecord,
};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Clock, CommentLedger, KeyedLock, LearningConfig};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeedbackOutcome {
    pub role: RoleType,
    pub previous_weight: f64,
    pub weight: f64,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreferenceRanking {
    /// All roles, highest weight first.
    pub ranked: Vec<(RoleType, f64)>,
    pub highest: Vec<RoleType>,
    pub lowest: Vec<RoleType>,
}

/// Feedback strength in `[0, 1]`; NaN counts as no signal.
pub fn normalized_strength(strength: f64) -> f64 {
    if strength.is_nan() {
        0.0
    } else {
        strength.clamp(0.0, 1.0)
    }
}

/// Strength with its polarity applied. Clicks count for `click_factor` of an
/// explicit thumbs up.
pub fn signed_strength(kind: InteractionType, strength: f64, click_factor: f64) -> f64 {
    let strength = normalized_strength(strength);
    match kind {
        InteractionType::ThumbsUp | InteractionType::Pickup => strength,
        InteractionType::Click => strength * click_factor,
        InteractionType::ThumbsDown => -strength,
    }
}

pub struct PreferenceLearner {
    store: Arc<dyn PreferenceStore>,
    bus: BusPublisher,
    ledger: CommentLedger,
    locks: KeyedLock,
    clock: Arc<dyn Clock>,
    config: LearningConfig,
    records: RwLock<HashMap<String, UserPreferenceRecord>>,
    storage_degraded: AtomicBool,
}

impl PreferenceLearner {
    pub fn new(
        store: Arc<dyn PreferenceStore>,
        bus: BusPublisher,
        ledger: CommentLedger,
        clock: Arc<dyn Clock>,
        config: LearningConfig,
    ) -> Self {
        Self {
            store,
            bus,
            ledger,
            locks: KeyedLock::new(),
            clock,
            config,
            records: RwLock::new(HashMap::new()),
            storage_degraded: AtomicBool::new(false),
        }
    }

    pub fn ledger(&self) -> &CommentLedger {
        &self.ledger
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    fn clamp_weight(&self, weight: f64) -> f64 {
        weight.clamp(self.config.min_weight, self.config.max_weight)
    }

    /// Cached record, loading it from the store on first access. Storage
    /// failures fall back to defaults.
    async fn record(&self, user_id: &str) -> UserPreferenceRecord {
        if let Some(record) = self.records.read().await.get(user_id) {
            return record.clone();
        }

        let loaded = match self.store.get_preference_record(user_id).await {
            Ok(Some(mut record)) => {
                let bounded: Vec<_> = record
                    .role_weights
                    .iter()
                    .map(|(role, weight)| (role, self.clamp_weight(weight)))
                    .collect();
                for (role, weight) in bounded {
                    record.role_weights.set(role, weight);
                }
                record
            }
            Ok(None) => UserPreferenceRecord::new(user_id),
            Err(err) => {
                tracing::warn!(user_id, error = %err, "failed to load preferences, using defaults");
                self.storage_degraded(err.to_string()).await;
                UserPreferenceRecord::new(user_id)
            }
        };

        // Never clobber a record a concurrent writer cached meanwhile.
        self.records
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert(loaded)
            .clone()
    }

    async fn storage_degraded(&self, reason: String) {
        if self.storage_degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        let notice = BusMessage::CapabilityDegraded {
            capability: Capability::Storage,
            reason,
        };
        if let Err(err) = self.bus.publish(notice).await {
            tracing::debug!(error = %err, "failed to publish storage notice");
        }
    }

    pub async fn get_personalized_weights(&self, user_id: &str) -> RoleWeights {
        self.record(user_id).await.role_weights
    }

    pub async fn preference_record(&self, user_id: &str) -> UserPreferenceRecord {
        self.record(user_id).await
    }

    pub async fn get_preference_ranking(&self, user_id: &str) -> PreferenceRanking {
        let ranked = self.get_personalized_weights(user_id).await.ranked();
        let top = ranked.first().map(|(_, w)| *w).unwrap_or_default();
        let bottom = ranked.last().map(|(_, w)| *w).unwrap_or_default();
        PreferenceRanking {
            highest: ranked
                .iter()
                .filter(|(_, w)| *w == top)
                .map(|(role, _)| *role)
                .collect(),
            lowest: ranked
                .iter()
                .filter(|(_, w)| *w == bottom)
                .map(|(role, _)| *role)
                .collect(),
            ranked,
        }
    }

    /// Roles still above the weight floor, strongest first.
    pub async fn active_roles(&self, user_id: &str) -> Vec<RoleType> {
        self.get_personalized_weights(user_id)
            .await
            .ranked()
            .into_iter()
            .filter(|(_, weight)| *weight > self.config.min_weight)
            .map(|(role, _)| role)
            .collect()
    }

    /// Applies one feedback event to the role of `comment_id`. Returns `None`
    /// when the comment is unknown.
    pub async fn apply_feedback(
        &self,
        user_id: &str,
        comment_id: Uuid,
        kind: InteractionType,
        strength: f64,
    ) -> Option<FeedbackOutcome> {
        let Some(entry) = self.ledger.lookup(&comment_id) else {
            tracing::debug!(user_id, %comment_id, "feedback for unknown comment ignored");
            return None;
        };

        let strength = normalized_strength(strength);
        let _guard = self.locks.acquire(user_id).await;
        let mut record = self.record(user_id).await;

        let previous_weight = record.role_weights.get(entry.role);
        let delta = self.config.learning_rate
            * signed_strength(kind, strength, self.config.click_factor);
        let weight = self.clamp_weight(previous_weight + delta);
        record.role_weights.set(entry.role, weight);

        let now = self.clock.now();
        record.interaction_history.push(InteractionEvent {
            comment_id,
            role: entry.role,
            interaction_type: kind,
            strength,
            at: now,
        });
        let overflow = record
            .interaction_history
            .len()
            .saturating_sub(self.config.history_limit);
        record.interaction_history.drain(..overflow);

        if kind.is_positive() {
            if let Some(topic) = entry.topic.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                record.topic_preferences.retain(|existing| existing != topic);
                record.topic_preferences.insert(0, topic.to_string());
                record.topic_preferences.truncate(self.config.topic_limit);
            }
        }
        record.updated_at = now;

        self.records
            .write()
            .await
            .insert(user_id.to_string(), record.clone());
        let persisted = self.persist(&record).await;

        tracing::info!(
            user_id,
            role = %entry.role,
            interaction = %kind,
            previous_weight,
            weight,
            "feedback applied"
        );
        let notice = BusMessage::FeedbackApplied {
            user_id: user_id.to_string(),
            comment_id,
            role: entry.role,
            interaction_type: kind,
            weight,
        };
        if let Err(err) = self.bus.publish(notice).await {
            tracing::debug!(error = %err, "failed to publish feedback notice");
        }

        Some(FeedbackOutcome {
            role: entry.role,
            previous_weight,
            weight,
            persisted,
        })
    }

    /// Restores default weights and forgets learned history and topics.
    pub async fn reset_preferences(&self, user_id: &str) -> bool {
        let _guard = self.locks.acquire(user_id).await;
        let mut record = self.record(user_id).await;
        record.role_weights = RoleWeights::default();
        record.interaction_history.clear();
        record.topic_preferences.clear();
        record.updated_at = self.clock.now();
        self.records
            .write()
            .await
            .insert(user_id.to_string(), record.clone());
        tracing::info!(user_id, "preferences reset");
        self.persist(&record).await
    }

    /// Counts a new session for the user. Returns the updated session count.
    pub async fn begin_session(&self, user_id: &str) -> u32 {
        let _guard = self.locks.acquire(user_id).await;
        let mut record = self.record(user_id).await;
        record.session_count = record.session_count.saturating_add(1);
        record.updated_at = self.clock.now();
        self.records
            .write()
            .await
            .insert(user_id.to_string(), record.clone());
        self.persist(&record).await;
        record.session_count
    }

    /// Writes the record, retrying with backoff. A final failure is
    /// published; the cached record keeps governing the session.
    async fn persist(&self, record: &UserPreferenceRecord) -> bool {
        let attempts = self.config.persist_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.store.put_preference_record(record).await {
                Ok(()) => return true,
                Err(err) => {
                    tracing::warn!(
                        user_id = %record.user_id,
                        attempt,
                        error = %err,
                        "failed to persist preferences"
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(persist_backoff_ms(attempt)))
                            .await;
                    }
                }
            }
        }

        let notice = BusMessage::PersistenceFailed {
            user_id: record.user_id.clone(),
            error: last_error,
        };
        if let Err(err) = self.bus.publish(notice).await {
            tracing::debug!(error = %err, "failed to publish persistence notice");
        }
        false
    }
}
