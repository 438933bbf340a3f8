//! Parses WhatsApp bridge webhook deliveries into [`InboundEvent`]s.
//!
//! The bridge posts one JSON envelope per event:
//! `{"event": "messages.upsert", "instance": "...", "sender": "<owner jid>", "data": {...}}`.

use crate::error::NormalizationError;
use crate::types::{
    ContactUpdate, EventKind, InboundEvent, InboundMessage, MediaDescriptor, MessageKind,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const MESSAGE_WRAPPERS: [&str; 5] = [
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayEnvelope {
    pub event: Option<String>,
    pub instance: Option<String>,
    pub sender: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageKey {
    remote_jid: Option<String>,
    remote_jid_alt: Option<String>,
    sender_pn: Option<String>,
    sender_lid: Option<String>,
    participant: Option<String>,
    participant_alt: Option<String>,
    participant_pn: Option<String>,
    participant_lid: Option<String>,
    from_me: Option<bool>,
    id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageData {
    key: Option<MessageKey>,
    push_name: Option<String>,
    message: Option<Value>,
    message_timestamp: Option<Value>,
}

/// Route-level hints: the path instance overrides the body, the body event overrides the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteHints<'a> {
    pub instance: Option<&'a str>,
    pub event: Option<&'a str>,
}

pub fn normalize_gateway_event(
    payload: &Value,
    hints: RouteHints<'_>,
) -> Result<InboundEvent, NormalizationError> {
    let envelope: GatewayEnvelope = serde_json::from_value(payload.clone())
        .map_err(|err| NormalizationError::MalformedPayload(err.to_string()))?;

    let event_name = non_blank(envelope.event.as_deref())
        .or(non_blank(hints.event))
        .ok_or_else(|| NormalizationError::MalformedPayload("missing event name".to_string()))?;
    let kind = EventKind::parse(event_name)
        .ok_or_else(|| NormalizationError::UnsupportedEventKind(event_name.to_string()))?;

    let instance = non_blank(hints.instance)
        .or(non_blank(envelope.instance.as_deref()))
        .ok_or_else(|| NormalizationError::MalformedPayload("missing instance".to_string()))?
        .to_string();

    let mut event = InboundEvent {
        kind,
        instance,
        remote_address: None,
        remote_alias: None,
        participant_address: None,
        participant_alias: None,
        owner_address: envelope.sender.clone(),
        push_name: None,
        message: None,
        contacts: Vec::new(),
        received_at: Utc::now(),
    };

    let data = envelope.data.unwrap_or(Value::Null);
    match kind {
        EventKind::MessageUpsert => fill_message(&mut event, first_entry(&data))?,
        EventKind::ContactsUpdate => event.contacts = parse_contacts(&data),
        EventKind::PresenceUpdate => {
            event.remote_address = str_field(&data, "id");
        }
        EventKind::ConnectionUpdate => {
            if event.owner_address.is_none() {
                event.owner_address = str_field(&data, "wuid");
            }
        }
    }

    Ok(event)
}

fn fill_message(event: &mut InboundEvent, data: &Value) -> Result<(), NormalizationError> {
    let data: MessageData = serde_json::from_value(data.clone())
        .map_err(|err| NormalizationError::MalformedPayload(err.to_string()))?;
    let key = data
        .key
        .ok_or_else(|| NormalizationError::MalformedPayload("message without key".to_string()))?;

    let remote = key
        .remote_jid
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| NormalizationError::MalformedPayload("message without remoteJid".to_string()))?;
    let id = key
        .id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| NormalizationError::MalformedPayload("message without id".to_string()))?;

    event.remote_alias = pick_alternate(
        &remote,
        [key.remote_jid_alt, key.sender_pn, key.sender_lid],
    );
    if let Some(participant) = key.participant.filter(|p| !p.trim().is_empty()) {
        event.participant_alias = pick_alternate(
            &participant,
            [key.participant_alt, key.participant_pn, key.participant_lid],
        );
        event.participant_address = Some(participant);
    }
    event.remote_address = Some(remote);
    event.push_name = data.push_name;

    let content = data.message.as_ref().map(unwrap_message);
    let (kind, text, media) = match content {
        Some(content) => classify(content),
        None => (MessageKind::Unsupported, None, None),
    };

    event.message = Some(InboundMessage {
        id,
        kind,
        from_me: key.from_me.unwrap_or(false),
        timestamp: data.message_timestamp.as_ref().and_then(parse_timestamp),
        text,
        media,
    });
    Ok(())
}

/// First alternate that differs from the primary address.
fn pick_alternate<const N: usize>(primary: &str, candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|c| !c.trim().is_empty() && c != primary)
}

fn unwrap_message(message: &Value) -> &Value {
    for wrapper in MESSAGE_WRAPPERS {
        if let Some(inner) = message.get(wrapper).and_then(|w| w.get("message")) {
            return unwrap_message(inner);
        }
    }
    message
}

fn classify(message: &Value) -> (MessageKind, Option<String>, Option<MediaDescriptor>) {
    if let Some(text) = message.get("conversation").and_then(Value::as_str) {
        return (MessageKind::Text, Some(text.to_string()), None);
    }
    if let Some(ext) = message.get("extendedTextMessage") {
        return (MessageKind::Text, str_field(ext, "text"), None);
    }

    let media_kinds = [
        ("imageMessage", MessageKind::Image),
        ("videoMessage", MessageKind::Video),
        ("audioMessage", MessageKind::Audio),
        ("stickerMessage", MessageKind::Sticker),
        ("documentMessage", MessageKind::Document),
    ];
    for (field, kind) in media_kinds {
        if let Some(node) = message.get(field) {
            return (kind, str_field(node, "caption"), media_descriptor(node));
        }
    }

    (MessageKind::Unsupported, None, None)
}

/// `None` when the node points at nothing fetchable.
fn media_descriptor(node: &Value) -> Option<MediaDescriptor> {
    let url = str_field(node, "url").filter(|u| !u.trim().is_empty());
    let direct_path = str_field(node, "directPath").filter(|p| !p.trim().is_empty());
    if url.is_none() && direct_path.is_none() {
        return None;
    }
    Some(MediaDescriptor {
        url,
        mime_type: str_field(node, "mimetype"),
        media_key: node.get("mediaKey").and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::String(_) | Value::Null => None,
            other => Some(other.to_string()),
        }),
        direct_path,
        file_name: str_field(node, "fileName"),
        file_length: node.get("fileLength").and_then(parse_long),
        animated: node.get("isAnimated").and_then(Value::as_bool),
    })
}

fn parse_contacts(data: &Value) -> Vec<ContactUpdate> {
    let entries: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![data],
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let address = str_field(entry, "remoteJid").or_else(|| str_field(entry, "id"))?;
            Some(ContactUpdate {
                alias: pick_alternate(
                    &address,
                    [str_field(entry, "remoteJidAlt"), str_field(entry, "lid")],
                ),
                address,
                display_name: str_field(entry, "pushName"),
                avatar_url: str_field(entry, "profilePicUrl"),
            })
        })
        .collect()
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = parse_long(value)?;
    // Some bridges send milliseconds.
    let secs = if raw > 100_000_000_000 { raw / 1000 } else { raw };
    Utc.timestamp_opt(secs, 0).single()
}

/// Numbers arrive as JSON numbers, numeric strings, or protobuf `{low, high}` longs.
fn parse_long(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(obj) => {
            let low = obj.get("low").and_then(Value::as_i64)?;
            let high = obj.get("high").and_then(Value::as_i64).unwrap_or(0);
            Some((high << 32) | (low & 0xffff_ffff))
        }
        _ => None,
    }
}

/// Message batches are delivered one entry per webhook call; extra entries are dropped.
fn first_entry(data: &Value) -> &Value {
    match data {
        Value::Array(items) => {
            if items.len() > 1 {
                debug!(dropped = items.len() - 1, "message batch carries more than one entry");
            }
            items.first().unwrap_or(&Value::Null)
        }
        other => other,
    }
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
