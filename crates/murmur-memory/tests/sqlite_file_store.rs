use chrono::Utc;
use murmur_memory::{PreferenceStore, SqliteStore};
use murmur_schema::{RoleType, RoleWeights, UserPreferenceRecord};

#[tokio::test]
async fn weights_survive_reopening_the_database() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = temp.path().join("data/murmur.db");

    let mut weights = RoleWeights::default();
    weights.set(RoleType::Insider, 1.75);
    weights.set(RoleType::Departure, 0.1);

    {
        let store = SqliteStore::open(&path).unwrap();
        store.put_role_weights("viewer-42", &weights).await.unwrap();
    }

    let reopened = SqliteStore::open(&path).unwrap();
    let loaded = reopened.get_role_weights("viewer-42").await.unwrap().unwrap();
    assert_eq!(loaded, weights);
}

#[tokio::test]
async fn full_record_roundtrip() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = SqliteStore::open(&temp.path().join("murmur.db")).unwrap();

    let mut record = UserPreferenceRecord::new("viewer-7");
    record.session_count = 12;
    record.topic_preferences = vec!["games".into(), "music".into()];
    record.role_weights.set(RoleType::Question, 0.6);
    record.updated_at = Utc::now();
    store.put_preference_record(&record).await.unwrap();

    let loaded = store.get_preference_record("viewer-7").await.unwrap().unwrap();
    assert_eq!(loaded.session_count, 12);
    assert_eq!(loaded.topic_preferences, record.topic_preferences);
    assert_eq!(loaded.role_weights, record.role_weights);
    assert_eq!(loaded.updated_at.timestamp_millis(), record.updated_at.timestamp_millis());
}
