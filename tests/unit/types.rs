use chrono::{TimeZone, Utc};
use wa_inbox::types::{
    Address, AddressKind, CanonicalAddress, EventKind, InboundEvent, InboundMessage, MessageKind,
};

fn event_with(timestamp: Option<i64>) -> InboundEvent {
    InboundEvent {
        kind: EventKind::MessageUpsert,
        instance: "main".to_string(),
        remote_address: Some("5511999998888@s.whatsapp.net".to_string()),
        remote_alias: None,
        participant_address: None,
        participant_alias: None,
        owner_address: None,
        push_name: None,
        message: Some(InboundMessage {
            id: "ABC".to_string(),
            kind: MessageKind::Text,
            from_me: false,
            timestamp: timestamp.and_then(|t| Utc.timestamp_opt(t, 0).single()),
            text: Some("hi".to_string()),
            media: None,
        }),
        contacts: Vec::new(),
        received_at: Utc.timestamp_opt(2_000, 0).unwrap(),
    }
}

#[test]
fn test_effective_timestamp_prefers_message() {
    assert_eq!(event_with(Some(100)).effective_timestamp().timestamp(), 100);
    assert_eq!(event_with(None).effective_timestamp().timestamp(), 2_000);
}

#[test]
fn test_address_c_us_is_stable() {
    let addr = Address::parse("5511999998888@c.us");
    assert!(addr.is_stable());
    assert_eq!(addr.raw(), "5511999998888@c.us");
}

#[test]
fn test_address_keeps_raw_untouched() {
    let raw = " 123:4@LID ";
    let addr = Address::parse(raw);
    assert_eq!(addr.raw(), raw);
    assert_eq!(addr.kind(), AddressKind::OpaqueAlias);
    assert_eq!(addr.bare(), "123@lid");
}

#[test]
fn test_canonical_serializes_as_string() {
    let canonical = CanonicalAddress::new("5511999998888");
    assert_eq!(serde_json::to_string(&canonical).unwrap(), "\"5511999998888\"");
    assert_eq!(canonical.to_string(), "5511999998888");
    assert_eq!(canonical.kind(), AddressKind::Stable);
}

#[test]
fn test_placeholders() {
    assert_eq!(MessageKind::Sticker.placeholder(), "[sticker]");
    assert_eq!(MessageKind::Text.placeholder(), "");
    assert!(MessageKind::Document.carries_media());
    assert!(!MessageKind::Unsupported.carries_media());
}

#[test]
fn test_event_kind_unknown() {
    assert_eq!(EventKind::parse("CONNECTION_UPDATE"), Some(EventKind::ConnectionUpdate));
    assert_eq!(EventKind::parse("groups.upsert"), None);
    assert_eq!(EventKind::parse(""), None);
}
