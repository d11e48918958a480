use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The eight comment archetypes a generated comment can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleType {
    Greeting,
    Departure,
    Reaction,
    Agreement,
    Question,
    Insider,
    Support,
    Playful,
}

impl RoleType {
    pub const ALL: [RoleType; 8] = [
        RoleType::Greeting,
        RoleType::Departure,
        RoleType::Reaction,
        RoleType::Agreement,
        RoleType::Question,
        RoleType::Insider,
        RoleType::Support,
        RoleType::Playful,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Departure => "departure",
            Self::Reaction => "reaction",
            Self::Agreement => "agreement",
            Self::Question => "question",
            Self::Insider => "insider",
            Self::Support => "support",
            Self::Playful => "playful",
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoleType::ALL
            .into_iter()
            .find(|role| role.as_str() == s.trim())
            .ok_or_else(|| anyhow!("unknown role: {s}"))
    }
}

pub const DEFAULT_ROLE_WEIGHT: f64 = 1.0;

/// Per-user weight for every role. Missing roles read as the default weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleWeights(BTreeMap<RoleType, f64>);

impl RoleWeights {
    pub fn uniform(weight: f64) -> Self {
        Self(RoleType::ALL.into_iter().map(|role| (role, weight)).collect())
    }

    pub fn get(&self, role: RoleType) -> f64 {
        self.0.get(&role).copied().unwrap_or(DEFAULT_ROLE_WEIGHT)
    }

    pub fn set(&mut self, role: RoleType, weight: f64) {
        self.0.insert(role, weight);
    }

    /// Iterates all eight roles, filling gaps with the default weight.
    pub fn iter(&self) -> impl Iterator<Item = (RoleType, f64)> + '_ {
        RoleType::ALL.into_iter().map(|role| (role, self.get(role)))
    }

    /// Roles ordered from highest to lowest weight. Ties keep declaration order.
    pub fn ranked(&self) -> Vec<(RoleType, f64)> {
        let mut ranked: Vec<_> = self.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

impl Default for RoleWeights {
    fn default() -> Self {
        Self::uniform(DEFAULT_ROLE_WEIGHT)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementLevel {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPace {
    Slow,
    #[default]
    Normal,
    Fast,
}

/// Live conversational context supplied by the caller for one generation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub recent_transcript: String,
    #[serde(default)]
    pub current_topic: Option<String>,
    #[serde(default = "default_engagement_level")]
    pub user_engagement_level: f64,
    #[serde(default)]
    pub speech_volume: f64,
    #[serde(default = "default_speech_rate")]
    pub speech_rate: f64,
    #[serde(default)]
    pub silence_duration_ms: u64,
    #[serde(default)]
    pub user_engagement: EngagementLevel,
    #[serde(default)]
    pub conversation_pace: ConversationPace,
    #[serde(default)]
    pub session_duration_ms: u64,
    /// Comments already shown in this session, oldest first.
    #[serde(default)]
    pub comment_history: Vec<Comment>,
}

impl ConversationContext {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            recent_transcript: transcript.into(),
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.current_topic = Some(topic.into());
        self
    }

    pub fn with_engagement(mut self, engagement: EngagementLevel) -> Self {
        self.user_engagement = engagement;
        self
    }

    pub fn with_session_duration_ms(mut self, duration_ms: u64) -> Self {
        self.session_duration_ms = duration_ms;
        self
    }

    /// True when the transcript carries nothing a template could react to.
    pub fn is_degenerate(&self) -> bool {
        self.recent_transcript.trim().chars().all(|c| !c.is_alphanumeric())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            transcript_excerpt: tail_chars(self.recent_transcript.trim(), 120),
            topic: self.current_topic.clone(),
            engagement: self.user_engagement,
            pace: self.conversation_pace,
        }
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self {
            recent_transcript: String::new(),
            current_topic: None,
            user_engagement_level: default_engagement_level(),
            speech_volume: 0.0,
            speech_rate: default_speech_rate(),
            silence_duration_ms: 0,
            user_engagement: EngagementLevel::default(),
            conversation_pace: ConversationPace::default(),
            session_duration_ms: 0,
            comment_history: Vec::new(),
        }
    }
}

fn default_engagement_level() -> f64 {
    0.5
}

fn default_speech_rate() -> f64 {
    1.0
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max)).collect()
}

/// The slice of context kept alongside a comment once it is emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub transcript_excerpt: String,
    #[serde(default)]
    pub topic: Option<String>,
    pub engagement: EngagementLevel,
    pub pace: ConversationPace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationSource {
    Rule,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub role: RoleType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub context: ContextSnapshot,
    pub source: GenerationSource,
    #[serde(default)]
    pub interaction: Option<UserInteraction>,
}

impl Comment {
    pub fn new(
        role: RoleType,
        content: impl Into<String>,
        context: ContextSnapshot,
        source: GenerationSource,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp,
            context,
            source,
            interaction: None,
        }
    }

    /// The only mutation a comment accepts after creation.
    pub fn attach_interaction(&mut self, interaction: UserInteraction) {
        self.interaction = Some(interaction);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Pickup,
    Click,
    ThumbsUp,
    ThumbsDown,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pickup => "pickup",
            Self::Click => "click",
            Self::ThumbsUp => "thumbs_up",
            Self::ThumbsDown => "thumbs_down",
        }
    }

    pub fn is_positive(&self) -> bool {
        !matches!(self, Self::ThumbsDown)
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pickup" => Ok(Self::Pickup),
            "click" => Ok(Self::Click),
            "thumbs_up" | "up" => Ok(Self::ThumbsUp),
            "thumbs_down" | "down" => Ok(Self::ThumbsDown),
            other => Err(anyhow!("unknown interaction type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInteraction {
    /// Weak reference: resolved by lookup, never owned.
    pub comment_id: Uuid,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
}

/// One applied feedback event, kept in the persisted preference record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub comment_id: Uuid,
    pub role: RoleType,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    pub strength: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferenceRecord {
    pub user_id: String,
    #[serde(default)]
    pub role_weights: RoleWeights,
    #[serde(default)]
    pub session_count: u32,
    #[serde(default)]
    pub topic_preferences: Vec<String>,
    #[serde(default)]
    pub interaction_history: Vec<InteractionEvent>,
    pub updated_at: DateTime<Utc>,
}

impl UserPreferenceRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role_weights: RoleWeights::default(),
            session_count: 0,
            topic_preferences: Vec::new(),
            interaction_history: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Periodic audio-derived signal pushed by the capture layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysisData {
    pub volume: f64,
    pub speech_rate: f64,
    #[serde(default)]
    pub volume_variance: f64,
    pub is_speaking: bool,
    #[serde(default)]
    pub silence_duration_ms: u64,
}

impl AudioAnalysisData {
    pub fn speaking(volume: f64, speech_rate: f64, volume_variance: f64) -> Self {
        Self {
            volume,
            speech_rate,
            volume_variance,
            is_speaking: true,
            silence_duration_ms: 0,
        }
    }

    pub fn silent(silence_duration_ms: u64) -> Self {
        Self {
            volume: 0.0,
            speech_rate: 0.0,
            volume_variance: 0.0,
            is_speaking: false,
            silence_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Model,
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    CommentGenerated {
        session_id: String,
        comment: Comment,
    },
    FeedbackApplied {
        user_id: String,
        comment_id: Uuid,
        role: RoleType,
        interaction_type: InteractionType,
        weight: f64,
    },
    PickupDetected {
        session_id: String,
        interaction: UserInteraction,
    },
    CapabilityDegraded {
        capability: Capability,
        reason: String,
    },
    PersistenceFailed {
        user_id: String,
        error: String,
    },
}
