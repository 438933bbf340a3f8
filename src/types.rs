use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageUpsert,
    ContactsUpdate,
    PresenceUpdate,
    ConnectionUpdate,
}

impl EventKind {
    /// Accepts `messages.upsert`, `MESSAGES_UPSERT` and `messages-upsert` spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.trim().to_lowercase().replace(['_', '-'], ".");
        match name.as_str() {
            "messages.upsert" => Some(Self::MessageUpsert),
            "contacts.update" | "contacts.upsert" => Some(Self::ContactsUpdate),
            "presence.update" => Some(Self::PresenceUpdate),
            "connection.update" => Some(Self::ConnectionUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Sticker,
    Document,
    Unsupported,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Sticker => "sticker",
            Self::Document => "document",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "sticker" => Self::Sticker,
            "document" => Self::Document,
            _ => Self::Unsupported,
        }
    }

    pub fn carries_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Sticker | Self::Document
        )
    }

    /// Preview text used when a message has no text or caption.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::Text => "",
            Self::Image => "[image]",
            Self::Video => "[video]",
            Self::Audio => "[audio]",
            Self::Sticker => "[sticker]",
            Self::Document => "[document]",
            Self::Unsupported => "[unsupported message]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Upstream url as sent by the gateway. For WhatsApp CDN media this is ciphertext.
    pub url: Option<String>,
    pub mime_type: Option<String>,
    /// Encryption context of CDN-hosted media. Absent when the url serves plaintext.
    pub media_key: Option<String>,
    pub direct_path: Option<String>,
    pub file_name: Option<String>,
    pub file_length: Option<i64>,
    pub animated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub kind: MessageKind,
    pub from_me: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub media: Option<MediaDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactUpdate {
    pub address: String,
    pub alias: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Canonical form of one gateway delivery. Fields missing from the raw payload stay `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub instance: String,
    /// Chat address: the correspondent in a direct chat, the group otherwise.
    pub remote_address: Option<String>,
    pub remote_alias: Option<String>,
    /// Group member who sent the message.
    pub participant_address: Option<String>,
    pub participant_alias: Option<String>,
    /// Address of the account the gateway instance is logged in as.
    pub owner_address: Option<String>,
    pub push_name: Option<String>,
    pub message: Option<InboundMessage>,
    pub contacts: Vec<ContactUpdate>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Message timestamp, falling back to the receipt time.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.message
            .as_ref()
            .and_then(|m| m.timestamp)
            .unwrap_or(self.received_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Stable,
    OpaqueAlias,
    Group,
    Broadcast,
}

/// A raw gateway address split into its user part and shape. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    raw: String,
    user: String,
    server: Option<String>,
    kind: AddressKind,
}

impl Address {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let (user_part, server) = match trimmed.split_once('@') {
            Some((user, server)) => (user, Some(server.to_lowercase())),
            None => (trimmed, None),
        };
        // `5511...:12@s.whatsapp.net` carries a device index after the colon.
        let user = user_part
            .split_once(':')
            .map(|(u, _)| u)
            .unwrap_or(user_part)
            .to_string();
        let digits_only = !user.is_empty() && user.chars().all(|c| c.is_ascii_digit());
        let kind = match server.as_deref() {
            Some("s.whatsapp.net") | Some("c.us") if digits_only => AddressKind::Stable,
            None if digits_only => AddressKind::Stable,
            Some("g.us") => AddressKind::Group,
            Some("broadcast") => AddressKind::Broadcast,
            _ => AddressKind::OpaqueAlias,
        };
        Self {
            raw: raw.to_string(),
            user,
            server,
            kind,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn is_stable(&self) -> bool {
        self.kind == AddressKind::Stable
    }

    pub fn is_opaque(&self) -> bool {
        self.kind == AddressKind::OpaqueAlias
    }

    /// `user@server` without device suffix; bare user when there is no server.
    pub fn bare(&self) -> String {
        match self.server.as_deref() {
            Some(server) => format!("{}@{}", self.user, server),
            None => self.user.clone(),
        }
    }
}

/// The deduplicated identity used as the conversation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalAddress(String);

impl CanonicalAddress {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> AddressKind {
        Address::parse(&self.0).kind()
    }

    pub fn is_group(&self) -> bool {
        self.kind() == AddressKind::Group
    }
}

impl fmt::Display for CanonicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
