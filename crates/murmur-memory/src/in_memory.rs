use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use murmur_schema::{Comment, RoleWeights, UserPreferenceRecord};
use tokio::sync::RwLock;

use crate::PreferenceStore;

/// Process-local store. Used when no database path is configured and in tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, UserPreferenceRecord>>>,
    comments: Arc<RwLock<HashMap<String, Vec<Comment>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryStore {
    async fn get_role_weights(&self, user_id: &str) -> Result<Option<RoleWeights>> {
        let records = self.records.read().await;
        Ok(records.get(user_id).map(|r| r.role_weights.clone()))
    }

    async fn put_role_weights(&self, user_id: &str, weights: &RoleWeights) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UserPreferenceRecord::new(user_id));
        record.role_weights = weights.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_preference_record(&self, user_id: &str) -> Result<Option<UserPreferenceRecord>> {
        Ok(self.records.read().await.get(user_id).cloned())
    }

    async fn put_preference_record(&self, record: &UserPreferenceRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn append_comment(&self, session_id: &str, comment: &Comment) -> Result<()> {
        let mut comments = self.comments.write().await;
        let session = comments.entry(session_id.to_string()).or_default();
        match session.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) => *existing = comment.clone(),
            None => session.push(comment.clone()),
        }
        Ok(())
    }

    async fn recent_comments(&self, session_id: &str, limit: usize) -> Result<Vec<Comment>> {
        let comments = self.comments.read().await;
        Ok(comments
            .get(session_id)
            .map(|list| list[list.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_schema::{ConversationContext, GenerationSource, RoleType};

    #[tokio::test]
    async fn role_weights_roundtrip() {
        let store = InMemoryStore::new();
        let mut weights = RoleWeights::default();
        weights.set(RoleType::Greeting, 0.25);
        store.put_role_weights("u", &weights).await.unwrap();
        assert_eq!(store.get_role_weights("u").await.unwrap(), Some(weights));
        assert!(store.get_role_weights("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_comments_respects_limit() {
        let store = InMemoryStore::new();
        for text in ["a", "b", "c"] {
            let comment = Comment::new(
                RoleType::Agreement,
                text,
                ConversationContext::default().snapshot(),
                GenerationSource::Rule,
                Utc::now(),
            );
            store.append_comment("s", &comment).await.unwrap();
        }
        let recent = store.recent_comments("s", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].content, "c");
    }
}
