use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use wa_inbox::db::{
    self, ConversationStore, MediaState, MessageInsert, NewConversation, NewMessage, SqlStore,
};
use wa_inbox::error::StoreError;
use wa_inbox::types::{CanonicalAddress, MessageKind};

async fn create_test_store(dir: &TempDir) -> SqlStore {
    let path = dir.path().join("test.db");
    db::connect(&format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .unwrap()
}

fn conversation(address: &str) -> NewConversation {
    NewConversation {
        instance: "main".to_string(),
        canonical_address: CanonicalAddress::new(address),
        display_name: None,
    }
}

fn message(conversation_id: &str, external_id: &str, ts: i64, text: &str) -> NewMessage {
    NewMessage {
        conversation_id: conversation_id.to_string(),
        instance: "main".to_string(),
        external_id: external_id.to_string(),
        from_me: false,
        kind: MessageKind::Text,
        sender_address: None,
        content: Some(text.to_string()),
        media_url: None,
        media_mime: None,
        media_key: None,
        media_direct_path: None,
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_schema_created() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    for table in ["conversations", "messages", "address_aliases"] {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}

#[tokio::test]
async fn test_create_conversation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;

    let mut new = conversation("5511999998888");
    new.display_name = Some("Ana".to_string());
    let first = store.create_conversation(&new).await.unwrap();
    new.display_name = Some("Other".to_string());
    let second = store.create_conversation(&new).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.display_name.as_deref(), Some("Ana"));
    assert!(!first.is_group);
    assert_eq!(first.unread_count, 0);

    let group = store
        .create_conversation(&conversation("120363@g.us"))
        .await
        .unwrap();
    assert!(group.is_group);
}

#[tokio::test]
async fn test_preview_never_regresses() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let conv = store.create_conversation(&conversation("5511999998888")).await.unwrap();

    let t100 = Utc.timestamp_opt(100, 0).unwrap();
    let t50 = Utc.timestamp_opt(50, 0).unwrap();
    store.update_conversation_preview(&conv.id, "newer", t100, 1).await.unwrap();
    store.update_conversation_preview(&conv.id, "older", t50, 1).await.unwrap();

    let conv = store
        .find_conversation("main", &CanonicalAddress::new("5511999998888"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.last_message.as_deref(), Some("newer"));
    assert_eq!(conv.last_message_at, Some(t100));
    assert_eq!(conv.unread_count, 2);
}

#[tokio::test]
async fn test_preview_update_on_missing_conversation_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let err = store
        .update_conversation_preview("missing", "x", Utc::now(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn test_create_message_dedupes_on_external_id() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let conv = store.create_conversation(&conversation("5511999998888")).await.unwrap();

    let first = store.create_message(&message(&conv.id, "ABC", 10, "hi")).await.unwrap();
    let second = store.create_message(&message(&conv.id, "ABC", 10, "hi again")).await.unwrap();

    let MessageInsert::Inserted(inserted) = first else {
        panic!("first insert should be new");
    };
    let MessageInsert::Duplicate(duplicate) = second else {
        panic!("second insert should be a duplicate");
    };
    assert_eq!(inserted.id, duplicate.id);
    assert_eq!(duplicate.content.as_deref(), Some("hi"));
    assert_eq!(store.list_messages(&conv.id).await.unwrap().len(), 1);

    // The same external id on another instance is a different message.
    let mut other = message(&conv.id, "ABC", 10, "elsewhere");
    other.instance = "other".to_string();
    assert!(!store.create_message(&other).await.unwrap().is_duplicate());
}

#[tokio::test]
async fn test_merge_moves_history_and_recomputes_preview() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let mut alias_new = conversation("777@lid");
    alias_new.display_name = Some("Bia".to_string());
    let alias = store.create_conversation(&alias_new).await.unwrap();
    let stable = store.create_conversation(&conversation("5511999998888")).await.unwrap();

    store.create_message(&message(&alias.id, "A1", 300, "latest from alias")).await.unwrap();
    store.update_conversation_preview(&alias.id, "latest from alias", Utc.timestamp_opt(300, 0).unwrap(), 1).await.unwrap();
    store.create_message(&message(&stable.id, "S1", 200, "older stable")).await.unwrap();
    store.update_conversation_preview(&stable.id, "older stable", Utc.timestamp_opt(200, 0).unwrap(), 2).await.unwrap();

    let merged = store.merge_conversations(&alias.id, &stable.id).await.unwrap();
    assert_eq!(merged.id, stable.id);
    assert_eq!(merged.last_message.as_deref(), Some("latest from alias"));
    assert_eq!(merged.last_message_at, Some(Utc.timestamp_opt(300, 0).unwrap()));
    assert_eq!(merged.unread_count, 3);
    assert_eq!(merged.display_name.as_deref(), Some("Bia"));

    let messages = store.list_messages(&stable.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].external_id, "A1");
    assert!(store
        .find_conversation("main", &CanonicalAddress::new("777@lid"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_merge_leaves_pre_merge_state() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let alias = store.create_conversation(&conversation("777@lid")).await.unwrap();
    store.create_message(&message(&alias.id, "A1", 300, "hi")).await.unwrap();

    // The winner does not exist, so the transaction is abandoned after moving messages.
    let err = store.merge_conversations(&alias.id, "no-such-conversation").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let still_there = store
        .find_conversation("main", &CanonicalAddress::new("777@lid"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_there.id, alias.id);
    let messages = store.list_messages(&alias.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation_id, alias.id);
}

#[tokio::test]
async fn test_rekey_conversation() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let alias = store.create_conversation(&conversation("777@lid")).await.unwrap();
    let rekeyed = store
        .rekey_conversation(&alias.id, &CanonicalAddress::new("5511999998888"))
        .await
        .unwrap();
    assert_eq!(rekeyed.id, alias.id);
    assert_eq!(rekeyed.canonical_address, "5511999998888");

    let taken = store.create_conversation(&conversation("888@lid")).await.unwrap();
    let err = store
        .rekey_conversation(&taken.id, &CanonicalAddress::new("5511999998888"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn test_media_state_transitions() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let conv = store.create_conversation(&conversation("5511999998888")).await.unwrap();
    let mut new = message(&conv.id, "IMG", 10, "");
    new.kind = MessageKind::Image;
    new.media_url = Some("https://mmg.whatsapp.net/x".to_string());
    let record = store.create_message(&new).await.unwrap().into_record();
    assert_eq!(record.media_state, MediaState::Pending);

    store.record_media_failure(&record.id, 2, "timeout").await.unwrap();
    let failed = store.get_message(&record.id).await.unwrap().unwrap();
    assert_eq!(failed.media_state, MediaState::Failed);
    assert_eq!(failed.media_attempts, 2);
    assert_eq!(failed.media_error.as_deref(), Some("timeout"));

    let pending = store.list_unstabilized_media(Utc::now(), 10, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(store.list_unstabilized_media(Utc::now(), 2, 10).await.unwrap().is_empty());

    store.update_message_media(&record.id, "https://cdn/x.jpg").await.unwrap();
    store.record_media_failure(&record.id, 1, "late failure").await.unwrap();
    let stabilized = store.get_message(&record.id).await.unwrap().unwrap();
    assert_eq!(stabilized.media_state, MediaState::Stabilized);
    assert_eq!(stabilized.media_url.as_deref(), Some("https://cdn/x.jpg"));
    assert!(stabilized.media_error.is_none());

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.conversations, 1);
    assert_eq!(counts.messages, 1);
    assert_eq!(counts.pending_media, 0);
}

#[tokio::test]
async fn test_alias_upsert_reports_changes() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    assert!(store.upsert_alias("main", "1@lid", "5511999998888").await.unwrap());
    assert!(!store.upsert_alias("main", "1@lid", "5511999998888").await.unwrap());
    assert!(store.upsert_alias("main", "1@lid", "5511777776666").await.unwrap());
    assert_eq!(
        store.find_alias("main", "1@lid").await.unwrap().as_deref(),
        Some("5511777776666")
    );
    assert!(store.find_alias("other", "1@lid").await.unwrap().is_none());
    assert_eq!(store.list_aliases("main").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_fresh_rows_read_back_with_null_columns() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let conv = store.create_conversation(&conversation("5511999998888")).await.unwrap();
    assert!(conv.display_name.is_none());
    assert!(conv.avatar_url.is_none());
    assert!(conv.last_message.is_none());
    assert!(conv.last_message_at.is_none());

    let mut bare = message(&conv.id, "NULLS", 10, "");
    bare.content = None;
    let inserted = store.create_message(&bare).await.unwrap().into_record();
    let read = store.get_message(&inserted.id).await.unwrap().unwrap();
    assert!(read.content.is_none());
    assert!(read.sender_address.is_none());
    assert!(read.media_url.is_none());
    assert!(read.media_key.is_none());
    assert!(read.media_error.is_none());
    assert_eq!(read.media_state, MediaState::None);
}

#[tokio::test]
async fn test_record_message_applies_preview_once() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let conv = store.create_conversation(&conversation("5511999998888")).await.unwrap();

    let first = store.record_message(&message(&conv.id, "M1", 100, "oi"), 1).await.unwrap();
    let again = store.record_message(&message(&conv.id, "M1", 100, "oi"), 1).await.unwrap();
    assert!(!first.is_duplicate());
    assert!(again.is_duplicate());

    let conv = store
        .find_conversation("main", &CanonicalAddress::new("5511999998888"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.unread_count, 1);
    assert_eq!(conv.last_message.as_deref(), Some("oi"));
    assert_eq!(conv.last_message_at, Some(Utc.timestamp_opt(100, 0).unwrap()));
}

#[tokio::test]
async fn test_record_message_rolls_back_without_conversation() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;

    let err = store
        .record_message(&message("no-such-conversation", "M1", 100, "oi"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(store.counts().await.unwrap().messages, 0);
    assert!(store.list_messages("no-such-conversation").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_media_context_persisted() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir).await;
    let conv = store.create_conversation(&conversation("5511999998888")).await.unwrap();
    let mut new = message(&conv.id, "ENC", 10, "");
    new.kind = MessageKind::Image;
    new.media_key = Some("a2V5".to_string());
    new.media_direct_path = Some("/v/t62/abc.enc".to_string());

    let record = store.create_message(&new).await.unwrap().into_record();
    let read = store.get_message(&record.id).await.unwrap().unwrap();
    assert_eq!(read.media_state, MediaState::Pending);
    assert!(read.media_url.is_none());
    assert_eq!(read.media_key.as_deref(), Some("a2V5"));
    assert_eq!(read.media_direct_path.as_deref(), Some("/v/t62/abc.enc"));
}
