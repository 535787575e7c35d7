use crewllm::history::{HistoryWriter, SqliteHistoryStore, StoredMessage};
use std::sync::Arc;

async fn fresh_store(dir: &tempfile::TempDir) -> SqliteHistoryStore {
    let store = SqliteHistoryStore::new(dir.path().join("history.db"));
    store.initialize().await.unwrap();
    store
}

#[tokio::test]
async fn messages_come_back_in_append_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let conversation = store.create(Some("Ordering".into())).await.unwrap();
    for i in 0..5 {
        store
            .add_message(&conversation.id, StoredMessage::new("user", format!("m{}", i)))
            .await
            .unwrap();
    }

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    let contents: Vec<&str> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn first_user_message_titles_a_fresh_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let conversation = store.create(None).await.unwrap();
    store
        .add_message(
            &conversation.id,
            StoredMessage::new("user", "Plan the launch timeline\nwith extra detail"),
        )
        .await
        .unwrap();

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    assert_eq!(loaded.title, "Plan the launch timeline");

    // An explicit title is never overwritten by inference.
    store
        .add_message(&conversation.id, StoredMessage::new("user", "second message"))
        .await
        .unwrap();
    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    assert_eq!(loaded.title, "Plan the launch timeline");
}

#[tokio::test]
async fn add_message_to_unknown_conversation_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let accepted = store
        .add_message("no-such-id", StoredMessage::new("user", "hello"))
        .await
        .unwrap();
    assert!(!accepted);
}

#[tokio::test]
async fn summaries_list_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let first = store.create(Some("Rust questions".into())).await.unwrap();
    store
        .add_message(&first.id, StoredMessage::new("user", "borrow checker woes"))
        .await
        .unwrap();
    let second = store.create(Some("Dinner plans".into())).await.unwrap();
    store
        .add_message(&second.id, StoredMessage::new("user", "pasta or curry"))
        .await
        .unwrap();

    let all = store.list_summaries().await.unwrap();
    assert_eq!(all.len(), 2);
    // Most recently updated first.
    assert_eq!(all[0].id, second.id);
    assert_eq!(all[0].message_count, 1);
    assert_eq!(all[0].last_message, "pasta or curry");

    let hits = store.search_summaries("borrow").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, first.id);

    // Title matches count too, case-insensitively.
    let hits = store.search_summaries("DINNER").await.unwrap();
    assert_eq!(hits.len(), 1);

    // Blank query falls back to the full listing.
    assert_eq!(store.search_summaries("  ").await.unwrap().len(), 2);
}

#[tokio::test]
async fn update_title_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let conversation = store.create(None).await.unwrap();
    assert!(store.update_title(&conversation.id, "Renamed").await.unwrap());
    assert!(!store.update_title(&conversation.id, "   ").await.unwrap());
    assert!(!store.update_title("ghost", "Nope").await.unwrap());

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    assert_eq!(loaded.title, "Renamed");

    assert!(store.delete(&conversation.id).await.unwrap());
    assert!(!store.delete(&conversation.id).await.unwrap());
    assert!(store.get(&conversation.id).await.unwrap().is_none());
}

#[tokio::test]
async fn get_or_create_reuses_existing_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let created = store.get_or_create(None).await.unwrap();
    let reused = store.get_or_create(Some(&created.id)).await.unwrap();
    assert_eq!(created.id, reused.id);

    let replacement = store.get_or_create(Some("missing-id")).await.unwrap();
    assert_ne!(replacement.id, "missing-id");
}

#[tokio::test]
async fn thoughts_and_duration_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = fresh_store(&dir).await;

    let conversation = store.create(None).await.unwrap();
    let message = StoredMessage::new("assistant", "answer")
        .with_thoughts(vec![serde_json::json!({"agent": "Harper", "content": "hmm"})])
        .with_duration(2.5);
    store.add_message(&conversation.id, message).await.unwrap();

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    let stored = &loaded.messages[0];
    assert_eq!(stored.duration, Some(2.5));
    let thoughts = stored.thoughts.as_ref().unwrap();
    assert_eq!(thoughts[0]["agent"], "Harper");
}

#[tokio::test]
async fn writer_applies_queued_operations_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(fresh_store(&dir).await);
    let conversation = store.create(None).await.unwrap();

    let writer = HistoryWriter::start(Arc::clone(&store));
    for i in 0..10 {
        writer.add_message(&conversation.id, StoredMessage::new("user", format!("w{}", i)));
    }
    writer.update_title(&conversation.id, "Written");
    writer.stop().await;

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    assert_eq!(loaded.title, "Written");
    assert_eq!(loaded.messages.len(), 10);
    let contents: Vec<&str> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents[0], "w0");
    assert_eq!(contents[9], "w9");
}
