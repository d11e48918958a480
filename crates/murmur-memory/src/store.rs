use anyhow::Result;
use async_trait::async_trait;
use murmur_schema::{Comment, RoleWeights, UserPreferenceRecord};

/// Persistent key-value contract consumed by the preference learner and the
/// comment scheduler.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_role_weights(&self, user_id: &str) -> Result<Option<RoleWeights>>;

    /// Writes only the weight map; the rest of the record is left untouched
    /// (or created with defaults).
    async fn put_role_weights(&self, user_id: &str, weights: &RoleWeights) -> Result<()>;

    async fn get_preference_record(&self, user_id: &str) -> Result<Option<UserPreferenceRecord>>;

    async fn put_preference_record(&self, record: &UserPreferenceRecord) -> Result<()>;

    async fn append_comment(&self, session_id: &str, comment: &Comment) -> Result<()>;

    /// Most recent comments of a session, oldest first.
    async fn recent_comments(&self, session_id: &str, limit: usize) -> Result<Vec<Comment>>;
}
