use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use murmur_schema::{Comment, RoleType};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub role: RoleType,
    pub topic: Option<String>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: HashMap<Uuid, LedgerEntry>,
    order: VecDeque<Uuid>,
}

/// Bounded lookup from comment id to the facts feedback needs. Holds no
/// comments; the oldest ids are forgotten first.
#[derive(Debug, Clone)]
pub struct CommentLedger {
    inner: Arc<Mutex<LedgerInner>>,
    capacity: usize,
}

impl CommentLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerInner::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn register(&self, comment: &Comment) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = LedgerEntry {
            role: comment.role,
            topic: comment.context.topic.clone(),
        };
        if inner.entries.insert(comment.id, entry).is_some() {
            return;
        }
        inner.order.push_back(comment.id);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn lookup(&self, comment_id: &Uuid) -> Option<LedgerEntry> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entries.get(comment_id).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommentLedger {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use murmur_schema::{ConversationContext, GenerationSource};

    fn comment(role: RoleType, topic: Option<&str>) -> Comment {
        let mut ctx = ConversationContext::new("x");
        ctx.current_topic = topic.map(str::to_string);
        Comment::new(role, "ok", ctx.snapshot(), GenerationSource::Rule, Utc::now())
    }

    #[test]
    fn lookup_returns_role_and_topic() {
        let ledger = CommentLedger::new(4);
        let c = comment(RoleType::Support, Some("cooking"));
        ledger.register(&c);
        assert_eq!(
            ledger.lookup(&c.id),
            Some(LedgerEntry {
                role: RoleType::Support,
                topic: Some("cooking".into())
            })
        );
        assert!(ledger.lookup(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let ledger = CommentLedger::new(2);
        let first = comment(RoleType::Reaction, None);
        ledger.register(&first);
        ledger.register(&comment(RoleType::Question, None));
        ledger.register(&comment(RoleType::Playful, None));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.lookup(&first.id).is_none());
    }
}
