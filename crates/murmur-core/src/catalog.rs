//! Built-in trigger patterns and comment templates for every role.

use murmur_schema::RoleType;

pub const TOPIC_PLACEHOLDER: &str = "{topic}";
pub const KEYWORD_PLACEHOLDER: &str = "{keyword}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// Stable `role:index` identifier.
    pub id: String,
    pub role: RoleType,
    pub text: &'static str,
}

impl Template {
    pub fn needs_topic(&self) -> bool {
        self.text.contains(TOPIC_PLACEHOLDER)
    }

    pub fn needs_keyword(&self) -> bool {
        self.text.contains(KEYWORD_PLACEHOLDER)
    }

    pub fn is_generic(&self) -> bool {
        !self.needs_topic() && !self.needs_keyword()
    }
}

#[derive(Debug, Clone)]
struct RoleEntry {
    patterns: &'static [&'static str],
    templates: Vec<Template>,
}

#[derive(Debug, Clone)]
pub struct RoleCatalog {
    entries: Vec<(RoleType, RoleEntry)>,
}

impl Default for RoleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RoleCatalog {
    pub fn builtin() -> Self {
        let entries = RoleType::ALL
            .into_iter()
            .map(|role| {
                let templates = role_templates(role)
                    .iter()
                    .copied()
                    .enumerate()
                    .map(|(index, text)| Template {
                        id: format!("{}:{index}", role.as_str()),
                        role,
                        text,
                    })
                    .collect();
                (
                    role,
                    RoleEntry {
                        patterns: role_patterns(role),
                        templates,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    fn entry(&self, role: RoleType) -> Option<&RoleEntry> {
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == role)
            .map(|(_, entry)| entry)
    }

    pub fn patterns(&self, role: RoleType) -> &[&'static str] {
        self.entry(role).map(|e| e.patterns).unwrap_or(&[])
    }

    pub fn templates(&self, role: RoleType) -> &[Template] {
        self.entry(role).map(|e| e.templates.as_slice()).unwrap_or(&[])
    }

    pub fn template(&self, id: &str) -> Option<&Template> {
        self.entries
            .iter()
            .flat_map(|(_, entry)| entry.templates.iter())
            .find(|t| t.id == id)
    }

    /// Case-insensitive substring match of any trigger pattern.
    pub fn matches(&self, role: RoleType, transcript: &str) -> bool {
        let haystack = transcript.to_lowercase();
        self.patterns(role)
            .iter()
            .any(|pattern| haystack.contains(&pattern.to_lowercase()))
    }

    pub fn matched_roles(&self, transcript: &str) -> Vec<RoleType> {
        RoleType::ALL
            .into_iter()
            .filter(|role| self.matches(*role, transcript))
            .collect()
    }
}

fn role_patterns(role: RoleType) -> &'static [&'static str] {
    match role {
        RoleType::Greeting => &[
            "おはよう",
            "こんにちは",
            "こんばんは",
            "はじめまして",
            "hello",
            "good morning",
            "good evening",
            "hi everyone",
        ],
        RoleType::Departure => &[
            "おやすみ",
            "また明日",
            "またね",
            "そろそろ",
            "お疲れ",
            "goodbye",
            "good night",
            "see you",
            "wrapping up",
        ],
        RoleType::Reaction => &["すごい", "えっ", "まじ", "やばい", "wow", "whoa", "no way"],
        RoleType::Agreement => &[
            "そうだよね",
            "確かに",
            "わかる",
            "だよね",
            "right",
            "exactly",
            "i think",
        ],
        RoleType::Question => &["なんで", "どうして", "かな", "?", "？", "why", "how"],
        RoleType::Insider => &["いつもの", "例の", "前回", "as always", "last time"],
        RoleType::Support => &[
            "頑張",
            "疲れ",
            "大変",
            "つらい",
            "不安",
            "tired",
            "hard",
            "worried",
        ],
        RoleType::Playful => &["笑", "ww", "ｗ", "冗談", "lol", "haha", "joke"],
    }
}

fn role_templates(role: RoleType) -> &'static [&'static str] {
    match role {
        RoleType::Greeting => &[
            "おはよう！",
            "こんにちは〜",
            "来たよ！",
            "やっほー",
            "{topic}の日だね、よろしく！",
            "hi!",
        ],
        RoleType::Departure => &[
            "おつかれさま！",
            "またね〜",
            "今日もありがとう",
            "おやすみなさい",
            "{topic}の話、楽しかった！",
            "see you!",
        ],
        RoleType::Reaction => &[
            "すごい！",
            "えー！",
            "なるほど",
            "まじか",
            "{keyword}！？",
            "{topic}でそれは熱い",
            "wow",
        ],
        RoleType::Agreement => &[
            "わかる",
            "それな",
            "確かに",
            "ほんとそれ",
            "{keyword}、わかる〜",
            "{topic}ってそうだよね",
            "so true",
        ],
        RoleType::Question => &[
            "それってどういうこと？",
            "もっと聞きたい！",
            "なんで？",
            "{keyword}って何？",
            "{topic}はどうなったの？",
            "how come?",
        ],
        RoleType::Insider => &[
            "いつものやつだ",
            "出た、例のやつ",
            "知ってた",
            "{topic}といえばこれ",
            "{keyword}、また来たね",
        ],
        RoleType::Support => &[
            "がんばって！",
            "応援してる",
            "無理しないでね",
            "大丈夫だよ",
            "{topic}、応援してるよ",
            "you got this",
        ],
        RoleType::Playful => &[
            "草",
            "ｗｗｗ",
            "それはずるいｗ",
            "天才か",
            "{keyword}で笑った",
            "{topic}芸人",
            "lol",
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_generic_templates_and_patterns() {
        let catalog = RoleCatalog::builtin();
        for role in RoleType::ALL {
            assert!(!catalog.patterns(role).is_empty(), "{role} has no patterns");
            assert!(
                catalog.templates(role).iter().any(Template::is_generic),
                "{role} has no generic template"
            );
        }
    }

    #[test]
    fn template_ids_are_stable_and_unique() {
        let catalog = RoleCatalog::builtin();
        let first = &catalog.templates(RoleType::Question)[0];
        assert_eq!(first.id, "question:0");
        assert_eq!(catalog.template("question:0"), Some(first));

        let mut ids: Vec<_> = RoleType::ALL
            .into_iter()
            .flat_map(|role| catalog.templates(role).iter().map(|t| t.id.clone()))
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn patterns_match_case_insensitively() {
        let catalog = RoleCatalog::builtin();
        assert!(catalog.matches(RoleType::Greeting, "Good Morning folks"));
        assert!(catalog.matches(RoleType::Greeting, "みんなおはよう"));
        assert!(!catalog.matches(RoleType::Departure, "みんなおはよう"));
        assert!(catalog
            .matched_roles("おやすみ、また明日")
            .contains(&RoleType::Departure));
    }
}
