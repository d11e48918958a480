use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use murmur_bus::{BusPublisher, EventBus};
use murmur_memory::{InMemoryStore, PreferenceStore, SqliteStore};
use murmur_provider::{create_runtime, ModelRuntime};
use murmur_scheduler::{Engagement, FrequencyGovernor};
use murmur_schema::{
    AudioAnalysisData, BusMessage, Capability, Comment, ConversationContext, InteractionType,
    RoleType, RoleWeights, UserInteraction,
};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    Clock, CommentLedger, FeedbackOutcome, HybridMixer, InferenceEngine, MixerStats, MurmurConfig,
    PickupDetector, PreferenceLearner, PreferenceRanking, RoleCatalog, RoleSelector,
    RuleBasedGenerator, StorageConfig, SystemClock, TemplateHistory,
};

/// Shared, explicitly constructed collaborators of every session.
pub struct Services {
    pub config: MurmurConfig,
    pub catalog: Arc<RoleCatalog>,
    pub engine: Arc<InferenceEngine>,
    pub learner: Arc<PreferenceLearner>,
    pub store: Arc<dyn PreferenceStore>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub ledger: CommentLedger,
}

impl Services {
    pub fn new(
        config: MurmurConfig,
        runtime: Arc<dyn ModelRuntime>,
        store: Arc<dyn PreferenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let ledger = CommentLedger::new(config.session.ledger_capacity);
        let engine = Arc::new(InferenceEngine::new(runtime, config.engine.model_id.clone()));
        let learner = Arc::new(PreferenceLearner::new(
            Arc::clone(&store),
            bus.publisher(),
            ledger.clone(),
            Arc::clone(&clock),
            config.learning.clone(),
        ));
        Self {
            config,
            catalog: Arc::new(RoleCatalog::builtin()),
            engine,
            learner,
            store,
            bus,
            clock,
            ledger,
        }
    }

    /// Builds the runtime and store the config names, on the system clock.
    pub fn from_config(config: MurmurConfig) -> Result<Self> {
        config.validate()?;
        let runtime = create_runtime(&config.engine.runtime)?;
        let store = Self::open_store(&config.storage)?;
        Ok(Self::new(config, runtime, store, Arc::new(SystemClock)))
    }

    /// SQLite at the configured path, otherwise an in-memory store.
    pub fn open_store(storage: &StorageConfig) -> Result<Arc<dyn PreferenceStore>> {
        let store: Arc<dyn PreferenceStore> = match &storage.path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => {
                tracing::info!("no storage path configured, preferences stay in memory");
                Arc::new(InMemoryStore::new())
            }
        };
        Ok(store)
    }

    /// Releases the model.
    pub fn shutdown(&self) {
        self.engine.unload();
    }
}

/// Tracks whether the model path is usable and whether that has been announced.
#[derive(Default)]
struct ModelHealth {
    degraded: AtomicBool,
    announced: AtomicBool,
}

impl ModelHealth {
    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    async fn degrade(&self, bus: &BusPublisher, session_id: &str, reason: String) {
        self.degraded.store(true, Ordering::SeqCst);
        if self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(session_id, %reason, "model unavailable, continuing with templates only");
        let notice = BusMessage::CapabilityDegraded {
            capability: Capability::Model,
            reason,
        };
        if let Err(err) = bus.publish(notice).await {
            tracing::debug!(error = %err, "failed to publish degraded notice");
        }
    }

    fn recover(&self) {
        self.degraded.store(false, Ordering::SeqCst);
        self.announced.store(false, Ordering::SeqCst);
    }
}

struct SessionState {
    templates: TemplateHistory,
    history: VecDeque<Comment>,
}

/// One live session: decides when to comment, produces the comment, and routes
/// feedback back into the learner.
pub struct CommentScheduler {
    services: Arc<Services>,
    session_id: String,
    user_id: String,
    started_at_ms: i64,
    governor: FrequencyGovernor,
    mixer: HybridMixer,
    session: AsyncMutex<SessionState>,
    pickups: Mutex<PickupDetector>,
    admission: Semaphore,
    model_health: Arc<ModelHealth>,
    bus: BusPublisher,
}

impl CommentScheduler {
    pub fn new(
        services: Arc<Services>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let config = &services.config;
        let mixer = HybridMixer::new(
            RoleSelector::new(Arc::clone(&services.catalog), config.selector.clone()),
            RuleBasedGenerator::new(Arc::clone(&services.catalog)),
            Arc::clone(&services.engine),
            config.mixer.clone(),
            Duration::from_millis(config.engine.infer_timeout_ms),
        );
        let session = SessionState {
            templates: TemplateHistory::new(config.selector.recent_templates),
            history: VecDeque::new(),
        };
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            started_at_ms: services.clock.now_ms(),
            governor: FrequencyGovernor::new(config.frequency.clone()),
            mixer,
            session: AsyncMutex::new(session),
            pickups: Mutex::new(PickupDetector::new(config.pickup.clone())),
            admission: Semaphore::new(config.session.queue_depth.max(1)),
            model_health: Arc::new(ModelHealth::default()),
            bus: services.bus.publisher(),
            services,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn pickups(&self) -> MutexGuard<'_, PickupDetector> {
        self.pickups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts the session for the user and starts the minute-reset ticker.
    /// Returns the user's session count.
    pub async fn start(&self) -> u32 {
        let clock = Arc::clone(&self.services.clock);
        self.governor.start_minute_reset(move || clock.now_ms());
        let sessions = self.services.learner.begin_session(&self.user_id).await;
        tracing::info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            sessions,
            "session started"
        );
        sessions
    }

    /// Produces the next comment, or `None` when the governor declines or the
    /// admission queue is full. Never fails.
    pub async fn generate_comment(&self, context: &ConversationContext) -> Option<Comment> {
        let Ok(_permit) = self.admission.try_acquire() else {
            tracing::debug!(session_id = %self.session_id, "generation queue full, skipping");
            return None;
        };
        let mut session = self.session.lock().await;

        let now_ms = self.services.clock.now_ms();
        if !self.governor.should_generate_at(now_ms) {
            tracing::trace!(session_id = %self.session_id, "governor declined");
            return None;
        }

        let mut context = context.clone();
        if context.comment_history.is_empty() {
            context.comment_history = session.history.iter().cloned().collect();
        }
        if context.session_duration_ms == 0 {
            context.session_duration_ms = (now_ms - self.started_at_ms).max(0) as u64;
        }

        let weights = self
            .services
            .learner
            .get_personalized_weights(&self.user_id)
            .await;
        let mixed = self
            .mixer
            .produce(
                &context,
                &weights,
                &session.templates,
                !self.model_health.is_degraded(),
                self.services.clock.now(),
            )
            .await;

        if let Some(template_id) = mixed.template_id {
            session.templates.record(template_id);
        }
        let comment = mixed.comment;
        self.services.ledger.register(&comment);
        self.pickups().track(&comment, now_ms);
        session.history.push_back(comment.clone());
        while session.history.len() > self.services.config.session.history_window {
            session.history.pop_front();
        }
        drop(session);

        if let Err(err) = self
            .services
            .store
            .append_comment(&self.session_id, &comment)
            .await
        {
            tracing::warn!(session_id = %self.session_id, error = %err, "failed to store comment");
        }

        tracing::info!(
            session_id = %self.session_id,
            comment_id = %comment.id,
            role = %comment.role,
            source = ?comment.source,
            "comment generated"
        );
        let notice = BusMessage::CommentGenerated {
            session_id: self.session_id.clone(),
            comment: comment.clone(),
        };
        if let Err(err) = self.bus.publish(notice).await {
            tracing::debug!(error = %err, "failed to publish comment");
        }
        Some(comment)
    }

    pub fn push_audio(&self, data: &AudioAnalysisData) {
        self.governor.update_at(data, self.services.clock.now_ms());
    }

    /// Matches transcribed speech against recent comments. Each pickup is
    /// published and fed to the learner as positive feedback.
    pub async fn observe_speech(&self, text: &str) -> Vec<UserInteraction> {
        let now_ms = self.services.clock.now_ms();
        let detected = self.pickups().observe(text, now_ms);

        let mut interactions = Vec::with_capacity(detected.len());
        for pickup in detected {
            let interaction = pickup.interaction;
            let notice = BusMessage::PickupDetected {
                session_id: self.session_id.clone(),
                interaction: interaction.clone(),
            };
            if let Err(err) = self.bus.publish(notice).await {
                tracing::debug!(error = %err, "failed to publish pickup");
            }
            self.services
                .learner
                .apply_feedback(
                    &self.user_id,
                    interaction.comment_id,
                    InteractionType::Pickup,
                    interaction.confidence,
                )
                .await;
            interactions.push(interaction);
        }
        interactions
    }

    /// Explicit feedback from the UI for a comment shown in this session.
    pub async fn record_feedback(
        &self,
        comment_id: Uuid,
        kind: InteractionType,
        strength: f64,
    ) -> Option<FeedbackOutcome> {
        self.services
            .learner
            .apply_feedback(&self.user_id, comment_id, kind, strength)
            .await
    }

    pub async fn role_weights(&self, user_id: &str) -> RoleWeights {
        self.services.learner.get_personalized_weights(user_id).await
    }

    pub async fn preference_ranking(&self) -> PreferenceRanking {
        self.services.learner.get_preference_ranking(&self.user_id).await
    }

    pub async fn active_roles(&self) -> Vec<RoleType> {
        self.services.learner.active_roles(&self.user_id).await
    }

    pub async fn reset_preferences(&self, user_id: &str) -> bool {
        self.services.learner.reset_preferences(user_id).await
    }

    pub fn engagement(&self) -> Engagement {
        self.governor.engagement()
    }

    pub fn mixer_stats(&self) -> MixerStats {
        self.mixer.stats()
    }

    pub fn is_degraded(&self) -> bool {
        self.model_health.is_degraded()
    }

    /// Comments of this session still in the rolling window, oldest first.
    pub async fn recent_comments(&self) -> Vec<Comment> {
        self.session.lock().await.history.iter().cloned().collect()
    }

    /// Loads the model in the background. A failed load switches the session
    /// to template-only generation and is announced once.
    pub fn warm_up(&self) -> JoinHandle<bool> {
        let engine = Arc::clone(&self.services.engine);
        let health = Arc::clone(&self.model_health);
        let bus = self.bus.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            match engine.load().await {
                Ok(_) => {
                    tracing::info!(%session_id, model = %engine.model_id(), "model ready");
                    true
                }
                Err(err) => {
                    health.degrade(&bus, &session_id, err.to_string()).await;
                    false
                }
            }
        })
    }

    /// Tries the model again after degradation.
    pub async fn retry_model(&self) -> bool {
        match self.services.engine.load().await {
            Ok(_) => {
                if self.model_health.is_degraded() {
                    tracing::info!(session_id = %self.session_id, "model recovered");
                }
                self.model_health.recover();
                true
            }
            Err(err) => {
                self.model_health
                    .degrade(&self.bus, &self.session_id, err.to_string())
                    .await;
                false
            }
        }
    }

    /// Stops the ticker and forgets pending pickups. Shared services stay up.
    pub fn dispose(&self) {
        self.governor.dispose();
        self.pickups().clear();
        tracing::info!(session_id = %self.session_id, "session disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use murmur_provider::{StubBehavior, StubRuntime};
    use murmur_schema::GenerationSource;

    fn services(config: MurmurConfig) -> Arc<Services> {
        Arc::new(Services::new(
            config,
            Arc::new(StubRuntime::default()),
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ))
    }

    fn quiet_config() -> MurmurConfig {
        let mut config = MurmurConfig::default();
        config.frequency.jitter = 0.0;
        config.frequency.seed = Some(7);
        config.mixer.seed = Some(7);
        config.selector.seed = Some(7);
        config
    }

    #[tokio::test]
    async fn governor_declines_back_to_back_calls() {
        let scheduler = CommentScheduler::new(services(quiet_config()), "s1", "u1");
        let ctx = ConversationContext::new("今日はいい天気ですね");
        assert!(scheduler.generate_comment(&ctx).await.is_some());
        assert!(scheduler.generate_comment(&ctx).await.is_none());
    }

    #[tokio::test]
    async fn generated_comments_are_tracked_and_stored() {
        let services = services(quiet_config());
        let scheduler = CommentScheduler::new(Arc::clone(&services), "s1", "u1");
        let comment = scheduler
            .generate_comment(&ConversationContext::new("hello there"))
            .await
            .unwrap();

        assert_eq!(comment.source, GenerationSource::Rule);
        assert!(services.ledger.lookup(&comment.id).is_some());
        assert_eq!(scheduler.recent_comments().await.len(), 1);
        let stored = services.store.recent_comments("s1", 10).await.unwrap();
        assert_eq!(stored[0].id, comment.id);
    }

    #[tokio::test]
    async fn start_counts_sessions() {
        let services = services(quiet_config());
        let first = CommentScheduler::new(Arc::clone(&services), "s1", "u1");
        assert_eq!(first.start().await, 1);
        first.dispose();
        let second = CommentScheduler::new(services, "s2", "u1");
        assert_eq!(second.start().await, 2);
        second.dispose();
    }

    #[tokio::test]
    async fn warm_up_loads_the_shared_engine() {
        let runtime = Arc::new(StubRuntime::new(StubBehavior::default()));
        let services = Arc::new(Services::new(
            quiet_config(),
            runtime.clone(),
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        ));
        let a = CommentScheduler::new(Arc::clone(&services), "s1", "u1");
        let b = CommentScheduler::new(Arc::clone(&services), "s2", "u2");
        assert!(a.warm_up().await.unwrap());
        assert!(b.warm_up().await.unwrap());
        assert_eq!(runtime.constructions(), 1);
        assert!(!a.is_degraded());
    }
}
