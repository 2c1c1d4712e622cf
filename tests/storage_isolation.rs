//! Persistence-layer coverage: conversation isolation over a real `SQLite`
//! database, independent of the in-memory store's own guarantees.

use std::time::SystemTime;

use agorum::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use agorum::storage::{ConversationStore, MessageRole, SqliteConversationStore, StoredMessage};

async fn store() -> (tempfile::TempDir, SqliteConversationStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = DatabasePath::new(dir.path().join("isolation.db")).expect("valid path");
    let config = DatabaseConfig::for_testing(path);
    let connection = DatabaseConnection::initialize(config).await.expect("db initializes");
    (dir, SqliteConversationStore::new(connection))
}

fn message(conversation_id: &str, content: &str) -> StoredMessage {
    StoredMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        role: MessageRole::User,
        content: content.to_string(),
        metadata: serde_json::json!({}),
        created_at: SystemTime::now(),
    }
}

#[tokio::test]
async fn recent_messages_never_returns_rows_from_another_conversation() {
    let (_dir, store) = store().await;
    store.ensure_conversation("c1", "alice", "Alice's chat").await.unwrap();
    store.ensure_conversation("c2", "bob", "Bob's chat").await.unwrap();

    store.append_message(&message("c1", "alice says hi")).await.unwrap();
    store.append_message(&message("c2", "bob says hi")).await.unwrap();
    store.append_message(&message("c1", "alice says bye")).await.unwrap();

    let c1_messages = store.recent_messages("c1", 10).await.unwrap();
    let c2_messages = store.recent_messages("c2", 10).await.unwrap();

    assert_eq!(c1_messages.len(), 2);
    assert!(c1_messages.iter().all(|m| m.conversation_id == "c1"));
    assert_eq!(c2_messages.len(), 1);
    assert!(c2_messages.iter().all(|m| m.conversation_id == "c2"));
}

#[tokio::test]
async fn latest_conversation_for_user_only_considers_that_users_conversations() {
    let (_dir, store) = store().await;
    store.ensure_conversation("c1", "alice", "first").await.unwrap();
    store.ensure_conversation("c2", "alice", "second").await.unwrap();
    store.ensure_conversation("c3", "bob", "unrelated").await.unwrap();

    store.append_message(&message("c1", "older")).await.unwrap();
    store.append_message(&message("c2", "newer")).await.unwrap();

    let latest = store.latest_conversation_for_user("alice").await.unwrap();
    assert_eq!(latest, Some("c2".to_string()));

    let bobs_latest = store.latest_conversation_for_user("bob").await.unwrap();
    assert_eq!(bobs_latest, Some("c3".to_string()));
}

#[tokio::test]
async fn ensure_conversation_is_idempotent() {
    let (_dir, store) = store().await;
    store.ensure_conversation("c1", "alice", "original title").await.unwrap();
    store.ensure_conversation("c1", "alice", "ignored title").await.unwrap();

    let record = store.get_conversation("c1").await.unwrap().unwrap();
    assert_eq!(record.title, "original title", "re-ensuring an existing conversation must not overwrite it");
}
