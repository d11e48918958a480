use std::sync::Arc;
use std::time::Duration;

use murmur_bus::Topic;
use murmur_core::{
    Clock, CommentScheduler, ManualClock, MurmurConfig, RoleSelector, Services,
};
use murmur_memory::InMemoryStore;
use murmur_provider::{StubBehavior, StubRuntime};
use murmur_schema::{
    AudioAnalysisData, BusMessage, Capability, ConversationContext, ConversationPace,
    EngagementLevel, GenerationSource, InteractionType, RoleType,
};

const START_MS: i64 = 1_700_000_000_000;

fn deterministic_config() -> MurmurConfig {
    let mut config = MurmurConfig::default();
    config.frequency.jitter = 0.0;
    config.frequency.seed = Some(42);
    config.mixer.seed = Some(42);
    config
}

fn build(
    config: MurmurConfig,
    behavior: StubBehavior,
) -> (Arc<Services>, Arc<ManualClock>, Arc<StubRuntime>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let runtime = Arc::new(StubRuntime::new(behavior));
    let services = Arc::new(Services::new(
        config,
        runtime.clone(),
        Arc::new(InMemoryStore::new()),
        clock.clone() as Arc<dyn Clock>,
    ));
    (services, clock, runtime)
}

/// Mixer settings that always try the model once it is loaded.
fn model_first(mut config: MurmurConfig) -> MurmurConfig {
    config.mixer.initial_ratio = 1.0;
    config.mixer.ratio_ceiling = 1.0;
    config
}

#[tokio::test]
async fn morning_greeting_yields_an_eligible_comment() {
    let config = deterministic_config();
    let (services, _, _) = build(config.clone(), StubBehavior::default());
    let scheduler = CommentScheduler::new(Arc::clone(&services), "stream-1", "viewer-1");

    let ctx = ConversationContext::new("おはよう").with_engagement(EngagementLevel::High);
    let comment = scheduler
        .generate_comment(&ctx)
        .await
        .expect("first call is always admitted");

    assert!(!comment.content.trim().is_empty());
    assert!(RoleType::ALL.contains(&comment.role));
    let selector = RoleSelector::new(Arc::clone(&services.catalog), config.selector);
    assert!(selector.is_eligible(comment.role, &ctx));
}

#[tokio::test]
async fn generation_never_fails_across_contexts() {
    let (services, clock, _) = build(deterministic_config(), StubBehavior::default());
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");

    let contexts = vec![
        ConversationContext::new(""),
        ConversationContext::new("   "),
        ConversationContext::new("!!!???"),
        ConversationContext::new("すごい！めっちゃ面白い"),
        ConversationContext::new("I made ramen for dinner").with_topic("cooking"),
        ConversationContext::new("またね、おやすみ").with_session_duration_ms(4 * 60 * 60_000),
        ConversationContext::new("a".repeat(5_000)),
        ConversationContext::new("ok")
            .with_engagement(EngagementLevel::Low)
            .with_topic(""),
    ];

    for round in 0..3 {
        for ctx in &contexts {
            clock.advance_ms(60_000);
            let comment = scheduler
                .generate_comment(ctx)
                .await
                .unwrap_or_else(|| panic!("round {round}: governor should allow after a minute"));
            assert!(!comment.content.trim().is_empty());
            assert!(comment.timestamp.timestamp_millis() > 0);
        }
    }
    assert_eq!(scheduler.recent_comments().await.len(), 24);
}

#[tokio::test]
async fn explicit_feedback_adjusts_the_comment_role() {
    let (services, _, _) = build(deterministic_config(), StubBehavior::default());
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");
    let comment = scheduler
        .generate_comment(&ConversationContext::new("what a great stream"))
        .await
        .unwrap();

    let outcome = scheduler
        .record_feedback(comment.id, InteractionType::ThumbsUp, 0.5)
        .await
        .unwrap();
    assert_eq!(outcome.role, comment.role);

    let weight = scheduler.role_weights("viewer-1").await.get(comment.role);
    assert!((weight - 1.05).abs() < 1e-12);
    assert_eq!(scheduler.role_weights("someone-else").await.get(comment.role), 1.0);
}

#[tokio::test]
async fn echoed_comment_counts_as_pickup() {
    let (services, clock, _) = build(deterministic_config(), StubBehavior::default());
    let mut pickups = services.bus.subscribe(Topic::PickupDetected).await;
    let scheduler = CommentScheduler::new(Arc::clone(&services), "stream-1", "viewer-1");
    let comment = scheduler
        .generate_comment(&ConversationContext::new("let me show you my garden"))
        .await
        .unwrap();

    clock.advance_ms(3_000);
    let interactions = scheduler.observe_speech(&comment.content).await;
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].comment_id, comment.id);
    assert_eq!(interactions[0].confidence, 1.0);
    assert!(matches!(
        pickups.try_recv(),
        Ok(BusMessage::PickupDetected { .. })
    ));

    let weight = scheduler.role_weights("viewer-1").await.get(comment.role);
    assert!((weight - 1.1).abs() < 1e-12);

    // A comment is picked up at most once.
    assert!(scheduler.observe_speech(&comment.content).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_model_falls_back_to_templates_and_lowers_ratio() {
    let mut config = model_first(deterministic_config());
    config.engine.infer_timeout_ms = 100;
    let behavior = StubBehavior {
        reply_delay: Duration::from_secs(5),
        ..StubBehavior::default()
    };
    let (services, _, _) = build(config, behavior);
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");
    assert!(scheduler.warm_up().await.unwrap());

    let before = scheduler.mixer_stats().ratio;
    let comment = scheduler
        .generate_comment(&ConversationContext::new("what are you cooking today"))
        .await
        .unwrap();

    assert_eq!(comment.source, GenerationSource::Rule);
    let stats = scheduler.mixer_stats();
    assert_eq!(stats.fallbacks, 1);
    assert!(stats.ratio < before);
}

#[tokio::test]
async fn fast_model_replies_are_used() {
    let config = model_first(deterministic_config());
    let behavior = StubBehavior {
        replies: vec!["それ最高！".to_string()],
        ..StubBehavior::default()
    };
    let (services, _, _) = build(config, behavior);
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");
    assert!(scheduler.warm_up().await.unwrap());

    let comment = scheduler
        .generate_comment(&ConversationContext::new("I finally beat the boss"))
        .await
        .unwrap();
    assert_eq!(comment.source, GenerationSource::Model);
    assert_eq!(comment.content, "それ最高！");
}

#[tokio::test]
async fn failed_load_degrades_once() {
    let behavior = StubBehavior {
        failing_loads: usize::MAX,
        ..StubBehavior::default()
    };
    let (services, clock, _) = build(model_first(deterministic_config()), behavior);
    let mut notices = services.bus.subscribe(Topic::CapabilityDegraded).await;
    let scheduler = CommentScheduler::new(Arc::clone(&services), "stream-1", "viewer-1");

    assert!(!scheduler.warm_up().await.unwrap());
    assert!(scheduler.is_degraded());
    assert!(!scheduler.retry_model().await);

    match notices.try_recv() {
        Ok(BusMessage::CapabilityDegraded { capability, .. }) => {
            assert_eq!(capability, Capability::Model)
        }
        other => panic!("expected a degraded notice, got {other:?}"),
    }
    assert!(notices.try_recv().is_err());

    for _ in 0..3 {
        clock.advance_ms(60_000);
        let comment = scheduler
            .generate_comment(&ConversationContext::new("still here?"))
            .await
            .unwrap();
        assert_eq!(comment.source, GenerationSource::Rule);
    }
}

#[tokio::test]
async fn retry_recovers_after_transient_load_failure() {
    let behavior = StubBehavior {
        failing_loads: 1,
        ..StubBehavior::default()
    };
    let (services, _, runtime) = build(deterministic_config(), behavior);
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");

    assert!(!scheduler.warm_up().await.unwrap());
    assert!(scheduler.retry_model().await);
    assert!(!scheduler.is_degraded());
    assert_eq!(runtime.attempts(), 2);
    assert_eq!(runtime.constructions(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_skips_without_blocking() {
    let mut config = model_first(deterministic_config());
    config.session.queue_depth = 1;
    config.engine.infer_timeout_ms = 3_000;
    let behavior = StubBehavior {
        reply_delay: Duration::from_secs(10),
        ..StubBehavior::default()
    };
    let (services, _, _) = build(config, behavior);
    let scheduler = Arc::new(CommentScheduler::new(services, "stream-1", "viewer-1"));
    assert!(scheduler.warm_up().await.unwrap());

    let busy = Arc::clone(&scheduler);
    let first = tokio::spawn(async move {
        busy.generate_comment(&ConversationContext::new("tell me about your trip"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let skipped = scheduler
        .generate_comment(&ConversationContext::new("hello?"))
        .await;
    assert!(skipped.is_none());

    let comment = first.await.unwrap().unwrap();
    assert_eq!(comment.source, GenerationSource::Rule);
}

#[tokio::test]
async fn comment_notices_reach_subscribers() {
    let (services, _, _) = build(deterministic_config(), StubBehavior::default());
    let mut generated = services.bus.subscribe(Topic::CommentGenerated).await;
    let scheduler = CommentScheduler::new(Arc::clone(&services), "stream-9", "viewer-1");
    let comment = scheduler
        .generate_comment(&ConversationContext::new("nice"))
        .await
        .unwrap();

    match generated.try_recv() {
        Ok(BusMessage::CommentGenerated {
            session_id,
            comment: published,
        }) => {
            assert_eq!(session_id, "stream-9");
            assert_eq!(published.id, comment.id);
        }
        other => panic!("expected comment notice, got {other:?}"),
    }
}

#[tokio::test]
async fn audio_drives_engagement() {
    let (services, clock, _) = build(deterministic_config(), StubBehavior::default());
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");

    for _ in 0..30 {
        clock.advance_ms(1_000);
        scheduler.push_audio(&AudioAnalysisData::speaking(1.0, 1.5, 0.3));
    }
    let lively = scheduler.engagement();
    assert_eq!(lively.pace, ConversationPace::Fast);

    for _ in 0..30 {
        clock.advance_ms(1_000);
        scheduler.push_audio(&AudioAnalysisData::silent(1_000));
    }
    assert!(scheduler.engagement().level < lively.level);
}

#[tokio::test]
async fn reset_restores_default_weights() {
    let (services, _, _) = build(deterministic_config(), StubBehavior::default());
    let scheduler = CommentScheduler::new(services, "stream-1", "viewer-1");
    let comment = scheduler
        .generate_comment(&ConversationContext::new("boo"))
        .await
        .unwrap();
    for _ in 0..5 {
        scheduler
            .record_feedback(comment.id, InteractionType::ThumbsDown, 1.0)
            .await;
    }
    assert!(scheduler.role_weights("viewer-1").await.get(comment.role) < 1.0);
    let ranking = scheduler.preference_ranking().await;
    assert_eq!(ranking.lowest, vec![comment.role]);

    assert!(scheduler.reset_preferences("viewer-1").await);
    assert_eq!(scheduler.role_weights("viewer-1").await.get(comment.role), 1.0);
    assert_eq!(scheduler.active_roles().await.len(), 8);
}
