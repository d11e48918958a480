//! Scripted session replay on a manual clock.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use murmur_core::{Clock, CommentScheduler, ManualClock, MixerStats, MurmurConfig, Services};
use murmur_provider::create_runtime;
use murmur_schema::{
    AudioAnalysisData, Comment, ConversationContext, GenerationSource, InteractionType, RoleType,
};
use serde::{Deserialize, Serialize};

const DEFAULT_START_MS: i64 = 1_700_000_000_000;
const TRANSCRIPT_UTTERANCES: usize = 3;

#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Load the model before the first step.
    #[serde(default)]
    pub warm_up: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct Step {
    /// Clock advance before the action runs.
    #[serde(default)]
    pub after_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum Action {
    Audio {
        volume: f64,
        speech_rate: f64,
        #[serde(default)]
        volume_variance: f64,
    },
    Silence {
        #[serde(default)]
        duration_ms: u64,
    },
    Say {
        text: String,
        #[serde(default)]
        topic: Option<String>,
    },
    Generate,
    /// Feedback on the most recent comment.
    Feedback {
        interaction: InteractionType,
        #[serde(default = "default_strength")]
        strength: f64,
    },
}

fn default_session_id() -> String {
    "simulated".to_string()
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_strength() -> f64 {
    1.0
}

#[derive(Debug, Serialize)]
pub struct EmittedComment {
    pub at_ms: i64,
    pub role: RoleType,
    pub source: GenerationSource,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub session_id: String,
    pub user_id: String,
    pub comments: Vec<EmittedComment>,
    pub skipped: usize,
    pub pickups: usize,
    pub feedback_applied: usize,
    pub degraded: bool,
    pub mixer: MixerStats,
    pub final_weights: Vec<(RoleType, f64)>,
}

pub fn load_script(path: &Path) -> Result<Script> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse script {}", path.display()))
}

pub async fn run(config: MurmurConfig, script: &Script) -> Result<SimulationReport> {
    let clock = Arc::new(ManualClock::new(DEFAULT_START_MS));
    let runtime = create_runtime(&config.engine.runtime)?;
    let store = Services::open_store(&config.storage)?;
    let services = Arc::new(Services::new(config, runtime, store, clock.clone()));
    let scheduler =
        CommentScheduler::new(Arc::clone(&services), &script.session_id, &script.user_id);
    scheduler.start().await;

    if script.warm_up && !scheduler.warm_up().await? {
        tracing::warn!("model failed to load, simulating with templates only");
    }

    let mut transcript: VecDeque<String> = VecDeque::new();
    let mut topic: Option<String> = None;
    let mut last_comment: Option<Comment> = None;
    let mut comments = Vec::new();
    let mut skipped = 0;
    let mut pickups = 0;
    let mut feedback_applied = 0;

    for (index, step) in script.steps.iter().enumerate() {
        clock.advance_ms(step.after_ms as i64);
        match &step.action {
            Action::Audio {
                volume,
                speech_rate,
                volume_variance,
            } => {
                scheduler.push_audio(&AudioAnalysisData::speaking(
                    *volume,
                    *speech_rate,
                    *volume_variance,
                ));
            }
            Action::Silence { duration_ms } => {
                scheduler.push_audio(&AudioAnalysisData::silent(*duration_ms));
            }
            Action::Say { text, topic: said } => {
                pickups += scheduler.observe_speech(text).await.len();
                transcript.push_back(text.clone());
                while transcript.len() > TRANSCRIPT_UTTERANCES {
                    transcript.pop_front();
                }
                if said.is_some() {
                    topic = said.clone();
                }
            }
            Action::Generate => {
                let engagement = scheduler.engagement();
                let mut context =
                    ConversationContext::new(transcript.iter().cloned().collect::<Vec<_>>().join(" "))
                        .with_engagement(engagement.bucket)
                        .with_session_duration_ms((clock.now_ms() - DEFAULT_START_MS) as u64);
                context.current_topic = topic.clone();
                context.user_engagement_level = engagement.level;
                context.conversation_pace = engagement.pace;

                match scheduler.generate_comment(&context).await {
                    Some(comment) => {
                        comments.push(EmittedComment {
                            at_ms: clock.now_ms() - DEFAULT_START_MS,
                            role: comment.role,
                            source: comment.source,
                            content: comment.content.clone(),
                        });
                        last_comment = Some(comment);
                    }
                    None => skipped += 1,
                }
            }
            Action::Feedback {
                interaction,
                strength,
            } => match &last_comment {
                Some(comment) => {
                    if scheduler
                        .record_feedback(comment.id, *interaction, *strength)
                        .await
                        .is_some()
                    {
                        feedback_applied += 1;
                    }
                }
                None => tracing::warn!(step = index, "feedback before any comment, ignored"),
            },
        }
    }

    let report = SimulationReport {
        session_id: script.session_id.clone(),
        user_id: script.user_id.clone(),
        comments,
        skipped,
        pickups,
        feedback_applied,
        degraded: scheduler.is_degraded(),
        mixer: scheduler.mixer_stats(),
        final_weights: services
            .learner
            .get_personalized_weights(&script.user_id)
            .await
            .ranked(),
    };
    scheduler.dispose();
    services.shutdown();
    Ok(report)
}
