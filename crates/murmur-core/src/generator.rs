use std::collections::VecDeque;
use std::sync::Arc;

use murmur_schema::{ConversationContext, RoleType};

use crate::{RoleCatalog, Template, KEYWORD_PLACEHOLDER, TOPIC_PLACEHOLDER};

const MAX_KEYWORD_CHARS: usize = 12;
const MAX_CJK_KEYWORD_CHARS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub content: String,
    pub template_id: String,
}

/// Recently used template ids of one session, oldest first.
#[derive(Debug, Clone)]
pub struct TemplateHistory {
    ids: VecDeque<String>,
    capacity: usize,
}

impl TemplateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.ids.retain(|existing| *existing != id);
        if self.capacity == 0 {
            return;
        }
        while self.ids.len() >= self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    /// Position in the window, 0 being the least recently used.
    fn recency(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|existing| existing == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

impl Default for TemplateHistory {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Deterministic template filler. Never fails: blank or degenerate context
/// falls back to the role's context-free templates.
#[derive(Debug, Clone)]
pub struct RuleBasedGenerator {
    catalog: Arc<RoleCatalog>,
}

impl Default for RuleBasedGenerator {
    fn default() -> Self {
        Self::new(Arc::new(RoleCatalog::builtin()))
    }
}

impl RuleBasedGenerator {
    pub fn new(catalog: Arc<RoleCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &RoleCatalog {
        &self.catalog
    }

    pub fn generate(
        &self,
        role: RoleType,
        context: &ConversationContext,
        recent: &TemplateHistory,
    ) -> GeneratedText {
        let degenerate = context.is_degenerate();
        let topic = context
            .current_topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && !degenerate);
        let keyword = if degenerate {
            None
        } else {
            extract_keyword(&context.recent_transcript)
        };

        let templates = self.catalog.templates(role);
        let mut candidates: Vec<&Template> = templates
            .iter()
            .filter(|t| !t.needs_topic() || topic.is_some())
            .filter(|t| !t.needs_keyword() || keyword.is_some())
            .collect();
        if candidates.is_empty() {
            candidates = templates.iter().filter(|t| t.is_generic()).collect();
        }

        let fresh: Vec<&Template> = candidates
            .iter()
            .copied()
            .filter(|t| !recent.contains(&t.id))
            .collect();

        let chosen = if fresh.is_empty() {
            candidates
                .iter()
                .copied()
                .min_by_key(|t| recent.recency(&t.id).unwrap_or(0))
        } else {
            let key = stable_hash(&context.recent_transcript, context.comment_history.len());
            Some(fresh[(key % fresh.len() as u64) as usize])
        };

        match chosen {
            Some(template) => GeneratedText {
                content: fill(template.text, topic, keyword.as_deref()),
                template_id: template.id.clone(),
            },
            // Only reachable with an empty catalog.
            None => GeneratedText {
                content: "…".to_string(),
                template_id: format!("{}:none", role.as_str()),
            },
        }
    }
}

fn fill(text: &str, topic: Option<&str>, keyword: Option<&str>) -> String {
    text.replace(TOPIC_PLACEHOLDER, topic.unwrap_or_default())
        .replace(KEYWORD_PLACEHOLDER, keyword.unwrap_or_default())
}

/// Picks the last reasonably short word of the transcript. Unspaced CJK
/// clauses yield their last katakana or kanji run instead of the whole clause.
pub fn extract_keyword(transcript: &str) -> Option<String> {
    transcript
        .split(|c: char| c.is_whitespace() || is_separator(c))
        .map(str::trim)
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .rev()
        .find_map(keyword_in_token)
}

fn keyword_in_token(token: &str) -> Option<String> {
    let len = token.chars().count();
    if token.chars().all(|c| script(c) == Script::Other) {
        return (2..=MAX_KEYWORD_CHARS).contains(&len).then(|| token.to_string());
    }

    let mut runs: Vec<(Script, String)> = Vec::new();
    for c in token.chars() {
        let class = script(c);
        if let Some((_, run)) = runs.last_mut().filter(|(last, _)| *last == class) {
            run.push(c);
        } else {
            runs.push((class, c.to_string()));
        }
    }
    let content_run = runs
        .iter()
        .rev()
        .filter(|(class, _)| matches!(class, Script::Katakana | Script::Han))
        .map(|(_, run)| run)
        .find(|run| (2..=MAX_CJK_KEYWORD_CHARS).contains(&run.chars().count()));
    match content_run {
        Some(run) => Some(run.clone()),
        None if runs.len() == 1 && (2..=MAX_CJK_KEYWORD_CHARS).contains(&len) => {
            Some(token.to_string())
        }
        None => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Hiragana,
    Katakana,
    Han,
    Other,
}

fn script(c: char) -> Script {
    match c {
        '\u{3040}'..='\u{309f}' => Script::Hiragana,
        '\u{30a0}'..='\u{30ff}' | '\u{ff66}'..='\u{ff9f}' => Script::Katakana,
        '\u{3400}'..='\u{4dbf}' | '\u{4e00}'..='\u{9fff}' | '\u{f900}'..='\u{faff}' => Script::Han,
        _ => Script::Other,
    }
}

fn is_separator(c: char) -> bool {
    c.is_ascii_punctuation() || matches!(c, '、' | '。' | '！' | '？' | '「' | '」' | '…' | '〜')
}

/// FNV-1a over the transcript and the history length.
fn stable_hash(transcript: &str, history_len: usize) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    transcript
        .as_bytes()
        .iter()
        .chain((history_len as u64).to_le_bytes().iter())
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}
