//! Implicit feedback: speech that echoes a recently shown comment counts as
//! the comment having been picked up.

use std::collections::{HashSet, VecDeque};

use chrono::{TimeZone, Utc};
use murmur_schema::{Comment, InteractionType, RoleType, UserInteraction};
use uuid::Uuid;

use crate::PickupConfig;

/// Lowercase words for space-delimited scripts, character bigrams for CJK runs.
/// Text with neither (emoji, symbols) falls back to its distinct characters.
pub fn tokenize(text: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, tokens: &mut HashSet<String>| {
        if !word.is_empty() {
            tokens.insert(std::mem::take(word));
        }
    };
    let flush_cjk = |run: &mut Vec<char>, tokens: &mut HashSet<String>| {
        match run.len() {
            0 => {}
            1 => {
                tokens.insert(run[0].to_string());
            }
            _ => {
                for pair in run.windows(2) {
                    tokens.insert(pair.iter().collect());
                }
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut tokens);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            word.extend(c.to_lowercase());
        } else {
            flush_word(&mut word, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_word(&mut word, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);
    if tokens.is_empty() {
        tokens.extend(
            text.chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| c.to_string()),
        );
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30ff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{4e00}'..='\u{9fff}'
        | '\u{f900}'..='\u{faff}'
        | '\u{ac00}'..='\u{d7af}'
        | '\u{ff66}'..='\u{ff9f}')
}

/// `0.5 * jaccard + 0.5 * (share of the comment's tokens echoed)`.
fn overlap_score(comment: &HashSet<String>, following: &HashSet<String>) -> f64 {
    if comment.is_empty() || following.is_empty() {
        return 0.0;
    }
    let shared = comment.intersection(following).count() as f64;
    let union = comment.union(following).count() as f64;
    let jaccard = shared / union;
    let coverage = shared / comment.len() as f64;
    (0.5 * jaccard + 0.5 * coverage).clamp(0.0, 1.0)
}

pub fn score_pickup(comment: &Comment, following_text: &str, elapsed_ms: u64, window_ms: u64) -> f64 {
    if elapsed_ms > window_ms {
        return 0.0;
    }
    overlap_score(&tokenize(&comment.content), &tokenize(following_text))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPickup {
    pub role: RoleType,
    pub interaction: UserInteraction,
}

#[derive(Debug)]
struct Tracked {
    comment_id: Uuid,
    role: RoleType,
    emitted_at_ms: i64,
    tokens: HashSet<String>,
}

/// Recently shown comments of one session waiting to be echoed.
#[derive(Debug)]
pub struct PickupDetector {
    config: PickupConfig,
    tracked: VecDeque<Tracked>,
}

impl PickupDetector {
    pub fn new(config: PickupConfig) -> Self {
        Self {
            config,
            tracked: VecDeque::new(),
        }
    }

    pub fn track(&mut self, comment: &Comment, now_ms: i64) {
        self.expire(now_ms);
        self.tracked.push_back(Tracked {
            comment_id: comment.id,
            role: comment.role,
            emitted_at_ms: now_ms,
            tokens: tokenize(&comment.content),
        });
    }

    /// Scores `text` against every tracked comment. Each comment yields at
    /// most one pickup; matched comments stop being tracked.
    pub fn observe(&mut self, text: &str, now_ms: i64) -> Vec<DetectedPickup> {
        self.expire(now_ms);
        let following = tokenize(text);
        if following.is_empty() {
            return Vec::new();
        }

        let timestamp = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let min_confidence = self.config.min_confidence;
        let mut detected = Vec::new();

        self.tracked.retain(|tracked| {
            let confidence = overlap_score(&tracked.tokens, &following);
            if confidence > min_confidence {
                detected.push(DetectedPickup {
                    role: tracked.role,
                    interaction: UserInteraction {
                        comment_id: tracked.comment_id,
                        interaction_type: InteractionType::Pickup,
                        timestamp,
                        confidence,
                    },
                });
                false
            } else {
                true
            }
        });

        for pickup in &detected {
            tracing::debug!(
                comment_id = %pickup.interaction.comment_id,
                confidence = pickup.interaction.confidence,
                "pickup detected"
            );
        }
        detected
    }

    fn expire(&mut self, now_ms: i64) {
        let window = self.config.window_ms as i64;
        self.tracked
            .retain(|tracked| now_ms - tracked.emitted_at_ms <= window);
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }
}
