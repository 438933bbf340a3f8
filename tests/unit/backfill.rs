use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wa_inbox::backfill::{compute_backoff, run_media_backfill, MEDIA_BACKFILL_MAX_ATTEMPTS};
use wa_inbox::db::{self, ConversationStore, MediaState, NewConversation, NewMessage};
use wa_inbox::media::{
    AuthContext, FetchError, FsObjectStore, MediaFetcher, MediaSource, MediaStabilizer,
    StabilizerSettings,
};
use wa_inbox::types::{CanonicalAddress, MessageKind};

struct StaticFetcher;

#[async_trait]
impl MediaFetcher for StaticFetcher {
    async fn fetch(&self, source: &MediaSource<'_>, _auth: &AuthContext) -> Result<Bytes, FetchError> {
        if source.url.is_some_and(|url| url.ends_with("/gone")) {
            Err(FetchError::Expired)
        } else {
            Ok(Bytes::from_static(b"%PDF-1.4 backfill"))
        }
    }
}

#[test]
fn test_compute_backoff_doubles_until_cap() {
    let base = Duration::from_secs(1);
    let cap = Duration::from_secs(10);
    let delays: Vec<u64> = (1..=6)
        .map(|attempt| compute_backoff(attempt, base, cap).as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
}

#[test]
fn test_compute_backoff_zero_base() {
    assert_eq!(
        compute_backoff(5, Duration::ZERO, Duration::from_secs(1)),
        Duration::ZERO
    );
}

#[tokio::test]
async fn test_media_sweep_stabilizes_and_parks_terminal_failures() {
    let store: Arc<dyn ConversationStore> = Arc::new(db::connect("sqlite::memory:").await.unwrap());
    let media_dir = TempDir::new().unwrap();
    let objects = Arc::new(FsObjectStore::new(media_dir.path(), "http://media.test/media"));
    let stabilizer = MediaStabilizer::new(
        store.clone(),
        Arc::new(StaticFetcher),
        objects,
        AuthContext::default(),
        StabilizerSettings::default(),
    );

    let conversation = store
        .create_conversation(&NewConversation {
            instance: "main".to_string(),
            canonical_address: CanonicalAddress::new("5511999998888"),
            display_name: None,
        })
        .await
        .unwrap();
    for (id, url) in [("OK1", "https://mmg.whatsapp.net/ok"), ("GONE1", "https://mmg.whatsapp.net/gone")] {
        store
            .create_message(&NewMessage {
                conversation_id: conversation.id.clone(),
                instance: "main".to_string(),
                external_id: id.to_string(),
                from_me: false,
                kind: MessageKind::Document,
                sender_address: None,
                content: None,
                media_url: Some(url.to_string()),
                media_mime: Some("application/pdf".to_string()),
                media_key: None,
                media_direct_path: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }

    let report = run_media_backfill(&store, &stabilizer, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.stabilized, 1);
    assert_eq!(report.failed, 1);

    let messages = store.list_messages(&conversation.id).await.unwrap();
    let ok = messages.iter().find(|m| m.external_id == "OK1").unwrap();
    assert_eq!(ok.media_state, MediaState::Stabilized);
    assert_eq!(ok.media_url.as_deref(), Some("http://media.test/media/main/OK1.pdf"));
    assert!(media_dir.path().join("main/OK1.pdf").exists());

    let gone = messages.iter().find(|m| m.external_id == "GONE1").unwrap();
    assert_eq!(gone.media_state, MediaState::Failed);
    assert_eq!(gone.media_attempts, MEDIA_BACKFILL_MAX_ATTEMPTS);
    assert_eq!(gone.media_url.as_deref(), Some("https://mmg.whatsapp.net/gone"));

    let second = run_media_backfill(&store, &stabilizer, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(second.scanned, 0);
}

#[tokio::test]
async fn test_media_sweep_respects_grace_period() {
    let store: Arc<dyn ConversationStore> = Arc::new(db::connect("sqlite::memory:").await.unwrap());
    let media_dir = TempDir::new().unwrap();
    let stabilizer = MediaStabilizer::new(
        store.clone(),
        Arc::new(StaticFetcher),
        Arc::new(FsObjectStore::new(media_dir.path(), "http://media.test/media")),
        AuthContext::default(),
        StabilizerSettings::default(),
    );
    let conversation = store
        .create_conversation(&NewConversation {
            instance: "main".to_string(),
            canonical_address: CanonicalAddress::new("5511999998888"),
            display_name: None,
        })
        .await
        .unwrap();
    store
        .create_message(&NewMessage {
            conversation_id: conversation.id,
            instance: "main".to_string(),
            external_id: "FRESH".to_string(),
            from_me: false,
            kind: MessageKind::Document,
            sender_address: None,
            content: None,
            media_url: Some("https://mmg.whatsapp.net/ok".to_string()),
            media_mime: None,
            media_key: None,
            media_direct_path: None,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    let report = run_media_backfill(&store, &stabilizer, 10, Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);
}
