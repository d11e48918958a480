//! SQLite-backed preference and comment persistence.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_schema::{Comment, RoleWeights, UserPreferenceRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;

use crate::migrations::run_migrations;
use crate::PreferenceStore;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        run_migrations(&conn)?;
        tracing::info!(path = %path.display(), "opened preference store");
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            f(&conn)
        })
        .await?
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_record(
    (user_id, weights, session_count, topics, history, updated_at): (
        String,
        String,
        i64,
        String,
        String,
        String,
    ),
) -> Result<UserPreferenceRecord> {
    Ok(UserPreferenceRecord {
        user_id,
        role_weights: serde_json::from_str(&weights)?,
        session_count: session_count.max(0) as u32,
        topic_preferences: serde_json::from_str(&topics)?,
        interaction_history: serde_json::from_str(&history)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

#[async_trait]
impl PreferenceStore for SqliteStore {
    async fn get_role_weights(&self, user_id: &str) -> Result<Option<RoleWeights>> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT role_weights FROM preferences WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|json| serde_json::from_str::<RoleWeights>(&json).map_err(anyhow::Error::from))
                .transpose()
        })
        .await
    }

    async fn put_role_weights(&self, user_id: &str, weights: &RoleWeights) -> Result<()> {
        let user_id = user_id.to_owned();
        let json = serde_json::to_string(weights)?;
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO preferences (user_id, role_weights, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id) DO UPDATE SET
                    role_weights = excluded.role_weights,
                    updated_at = excluded.updated_at
                "#,
                params![user_id, json, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_preference_record(&self, user_id: &str) -> Result<Option<UserPreferenceRecord>> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    r#"
                    SELECT user_id, role_weights, session_count, topic_preferences,
                           interaction_history, updated_at
                    FROM preferences
                    WHERE user_id = ?1
                    "#,
                    params![user_id],
                    row_to_record,
                )
                .optional()?;
            raw.map(decode_record).transpose()
        })
        .await
    }

    async fn put_preference_record(&self, record: &UserPreferenceRecord) -> Result<()> {
        let weights = serde_json::to_string(&record.role_weights)?;
        let topics = serde_json::to_string(&record.topic_preferences)?;
        let history = serde_json::to_string(&record.interaction_history)?;
        let user_id = record.user_id.clone();
        let session_count = record.session_count as i64;
        let updated_at = record.updated_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO preferences (
                    user_id, role_weights, session_count, topic_preferences,
                    interaction_history, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![user_id, weights, session_count, topics, history, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_comment(&self, session_id: &str, comment: &Comment) -> Result<()> {
        let session_id = session_id.to_owned();
        let id = comment.id.to_string();
        let role = comment.role.as_str();
        let ts = comment.timestamp.to_rfc3339();
        let body = serde_json::to_string(comment)?;
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO comments (id, session_id, role, ts, body)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET body = excluded.body
                "#,
                params![id, session_id, role, ts, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_comments(&self, session_id: &str, limit: usize) -> Result<Vec<Comment>> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT body FROM comments
                WHERE session_id = ?1
                ORDER BY seq DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![session_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?;
            let mut comments = Vec::new();
            for row in rows {
                comments.push(serde_json::from_str::<Comment>(&row?)?);
            }
            comments.reverse();
            Ok(comments)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_schema::{
        ConversationContext, GenerationSource, InteractionEvent, InteractionType, RoleType,
    };
    use uuid::Uuid;

    fn comment(text: &str) -> Comment {
        Comment::new(
            RoleType::Reaction,
            text,
            ConversationContext::new("transcript").snapshot(),
            GenerationSource::Rule,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn role_weights_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_role_weights("u1").await.unwrap().is_none());

        let mut weights = RoleWeights::default();
        weights.set(RoleType::Question, 0.35);
        weights.set(RoleType::Playful, 2.75);
        store.put_role_weights("u1", &weights).await.unwrap();

        let loaded = store.get_role_weights("u1").await.unwrap().unwrap();
        assert_eq!(loaded, weights);
    }

    #[tokio::test]
    async fn put_role_weights_keeps_rest_of_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = UserPreferenceRecord::new("u1");
        record.session_count = 4;
        record.topic_preferences = vec!["cooking".into()];
        record.interaction_history.push(InteractionEvent {
            comment_id: Uuid::new_v4(),
            role: RoleType::Support,
            interaction_type: InteractionType::ThumbsUp,
            strength: 1.0,
            at: Utc::now(),
        });
        store.put_preference_record(&record).await.unwrap();

        let mut weights = RoleWeights::default();
        weights.set(RoleType::Support, 1.1);
        store.put_role_weights("u1", &weights).await.unwrap();

        let loaded = store.get_preference_record("u1").await.unwrap().unwrap();
        assert_eq!(loaded.session_count, 4);
        assert_eq!(loaded.topic_preferences, vec!["cooking".to_string()]);
        assert_eq!(loaded.interaction_history.len(), 1);
        assert_eq!(loaded.role_weights.get(RoleType::Support), 1.1);
    }

    #[tokio::test]
    async fn comments_are_returned_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        for text in ["one", "two", "three"] {
            store.append_comment("s1", &comment(text)).await.unwrap();
        }
        store.append_comment("s2", &comment("other")).await.unwrap();

        let recent = store.recent_comments("s1", 2).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn re_appending_a_comment_updates_it_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut c = comment("hello");
        store.append_comment("s1", &c).await.unwrap();
        c.attach_interaction(murmur_schema::UserInteraction {
            comment_id: c.id,
            interaction_type: InteractionType::Click,
            timestamp: Utc::now(),
            confidence: 1.0,
        });
        store.append_comment("s1", &c).await.unwrap();

        let recent = store.recent_comments("s1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].interaction.is_some());
    }
}
