use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_schema::{Comment, ConversationContext, GenerationSource, RoleType, RoleWeights};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::{
    EngineState, InferenceEngine, MixerConfig, RoleSelector, RuleBasedGenerator, TemplateHistory,
};

const PROMPT_TRANSCRIPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MixerStats {
    /// Probability of attempting the model path.
    pub ratio: f64,
    pub attempts: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub last_latency_ms: Option<u64>,
}

/// A produced comment plus the template it came from, if rule-based.
#[derive(Debug, Clone)]
pub struct MixedComment {
    pub comment: Comment,
    pub template_id: Option<String>,
}

struct MixerInner {
    rng: StdRng,
    stats: MixerStats,
}

/// Chooses between template and model generation per request and adapts the
/// model share from observed latency and failures.
pub struct HybridMixer {
    selector: RoleSelector,
    generator: RuleBasedGenerator,
    engine: Arc<InferenceEngine>,
    config: MixerConfig,
    infer_timeout: Duration,
    inner: Mutex<MixerInner>,
}

impl HybridMixer {
    pub fn new(
        selector: RoleSelector,
        generator: RuleBasedGenerator,
        engine: Arc<InferenceEngine>,
        config: MixerConfig,
        infer_timeout: Duration,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let ratio = config
            .initial_ratio
            .clamp(config.ratio_floor, config.ratio_ceiling);
        Self {
            selector,
            generator,
            engine,
            config,
            infer_timeout,
            inner: Mutex::new(MixerInner {
                rng,
                stats: MixerStats {
                    ratio,
                    attempts: 0,
                    successes: 0,
                    fallbacks: 0,
                    last_latency_ms: None,
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> MixerStats {
        self.lock().stats
    }

    pub fn ratio(&self) -> f64 {
        self.lock().stats.ratio
    }

    /// Produces one comment. Model failures of any kind fall back to the
    /// template path, so this always yields a comment.
    pub async fn produce(
        &self,
        context: &ConversationContext,
        weights: &RoleWeights,
        recent: &TemplateHistory,
        model_allowed: bool,
        now: DateTime<Utc>,
    ) -> MixedComment {
        let model_ready = matches!(
            self.engine.state(),
            EngineState::Loaded | EngineState::Inferring
        );
        let (role, try_model) = {
            let mut inner = self.lock();
            let MixerInner { rng, stats } = &mut *inner;
            let role = self.selector.select_role(weights, context, &mut *rng);
            let try_model = model_allowed
                && model_ready
                && !context.is_degenerate()
                && rng.gen_bool(stats.ratio.clamp(0.0, 1.0));
            (role, try_model)
        };

        if try_model {
            let prompt = build_prompt(role, context);
            let started = tokio::time::Instant::now();
            let result = self.engine.infer(&prompt, self.infer_timeout).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let text = match result {
                Ok(raw) => sanitize(&raw, self.config.max_comment_chars),
                Err(err) => {
                    tracing::debug!(role = %role, error = %err, "model path failed, using templates");
                    None
                }
            };
            let fast = latency_ms <= self.config.slow_latency_ms;
            self.record_attempt(text.is_some(), fast, latency_ms);

            if let Some(content) = text {
                let comment =
                    Comment::new(role, content, context.snapshot(), GenerationSource::Model, now);
                return MixedComment {
                    comment,
                    template_id: None,
                };
            }
        }

        let generated = self.generator.generate(role, context, recent);
        let comment = Comment::new(
            role,
            generated.content,
            context.snapshot(),
            GenerationSource::Rule,
            now,
        );
        MixedComment {
            comment,
            template_id: Some(generated.template_id),
        }
    }

    fn record_attempt(&self, success: bool, fast: bool, latency_ms: u64) {
        let config = &self.config;
        let mut inner = self.lock();
        let stats = &mut inner.stats;
        stats.attempts += 1;
        stats.last_latency_ms = Some(latency_ms);
        if success {
            stats.successes += 1;
        } else {
            stats.fallbacks += 1;
        }

        let goal = if success && fast {
            config.ratio_ceiling
        } else {
            0.0
        };
        let previous = stats.ratio;
        stats.ratio = (previous + config.adapt_rate * (goal - previous))
            .clamp(config.ratio_floor, config.ratio_ceiling);
        tracing::debug!(
            success,
            latency_ms,
            ratio = stats.ratio,
            previous,
            "model ratio adapted"
        );
    }
}

fn role_instruction(role: RoleType) -> &'static str {
    match role {
        RoleType::Greeting => "greet the speaker warmly",
        RoleType::Departure => "say a friendly goodbye",
        RoleType::Reaction => "react with surprise or excitement",
        RoleType::Agreement => "agree with what was just said",
        RoleType::Question => "ask a short curious question",
        RoleType::Insider => "make a knowing regular-viewer remark",
        RoleType::Support => "offer encouragement",
        RoleType::Playful => "tease playfully",
    }
}

pub fn build_prompt(role: RoleType, context: &ConversationContext) -> String {
    let transcript = context.recent_transcript.trim();
    let count = transcript.chars().count();
    let excerpt: String = transcript
        .chars()
        .skip(count.saturating_sub(PROMPT_TRANSCRIPT_CHARS))
        .collect();

    let mut prompt = String::from(
        "You write a single short live-chat comment in the same language as the speaker.\n",
    );
    prompt.push_str(&format!("Role: {} ({})\n", role, role_instruction(role)));
    if let Some(topic) = context.current_topic.as_deref().filter(|t| !t.trim().is_empty()) {
        prompt.push_str(&format!("Topic: {}\n", topic.trim()));
    }
    prompt.push_str(&format!("Speaker said: {excerpt}\n"));
    prompt.push_str("Comment:");
    prompt
}

/// First non-empty line, unquoted and cut to `max_chars`. `None` when nothing
/// usable is left.
pub fn sanitize(raw: &str, max_chars: usize) -> Option<String> {
    const QUOTES: &[char] = &['"', '\'', '「', '」', '『', '』', '“', '”', '`'];

    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line.strip_prefix("Comment:").unwrap_or(line).trim();
    let line = line.trim_matches(QUOTES).trim();
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(max_chars).collect())
}
