use serde::{Deserialize, Serialize};

/// Message classification derived from the upstream payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    Reaction,
    Poll,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Document => "document",
            MessageType::Sticker => "sticker",
            MessageType::Location => "location",
            MessageType::Contact => "contact",
            MessageType::Reaction => "reaction",
            MessageType::Poll => "poll",
            MessageType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "text" => MessageType::Text,
            "image" => MessageType::Image,
            "video" => MessageType::Video,
            "audio" => MessageType::Audio,
            "document" => MessageType::Document,
            "sticker" => MessageType::Sticker,
            "location" => MessageType::Location,
            "contact" => MessageType::Contact,
            "reaction" => MessageType::Reaction,
            "poll" => MessageType::Poll,
            _ => MessageType::Unknown,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            MessageType::Image
                | MessageType::Video
                | MessageType::Audio
                | MessageType::Document
                | MessageType::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Received,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Received => "received",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => DeliveryStatus::Sent,
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Received,
        }
    }
}

/// Provenance tag recording which sync pass produced a message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSession {
    InitialSync,
    /// Tagged with the epoch-millis timestamp of the sync pass.
    ProgressiveSync(i64),
    RealTime,
    ManualFetch,
}

impl CollectionSession {
    pub fn as_string(&self) -> String {
        match self {
            CollectionSession::InitialSync => "initial_sync".to_string(),
            CollectionSession::ProgressiveSync(ts) => format!("progressive_sync_{ts}"),
            CollectionSession::RealTime => "real_time".to_string(),
            CollectionSession::ManualFetch => "manual_fetch".to_string(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "initial_sync" => CollectionSession::InitialSync,
            "real_time" => CollectionSession::RealTime,
            "manual_fetch" => CollectionSession::ManualFetch,
            other => match other
                .strip_prefix("progressive_sync_")
                .and_then(|ts| ts.parse().ok())
            {
                Some(ts) => CollectionSession::ProgressiveSync(ts),
                None => CollectionSession::ManualFetch,
            },
        }
    }
}

/// A single cached message. Immutable once stored, except for delivery
/// status updates and sent-message id reconciliation.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub from_me: bool,
    pub message_type: MessageType,
    /// Display text. `None` for non-text payloads, never an empty string
    /// standing in for "no text".
    pub content: Option<String>,
    /// Epoch millis.
    pub timestamp: i64,
    pub status: DeliveryStatus,
    pub quoted_id: Option<String>,
    pub sender_name: Option<String>,
    pub collection: CollectionSession,
}

/// Metadata for a fetched media payload, owned by a message.
#[derive(Debug, Clone)]
pub struct Media {
    pub id: String,
    pub message_id: String,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_session_round_trips() {
        for session in [
            CollectionSession::InitialSync,
            CollectionSession::ProgressiveSync(1700000000000),
            CollectionSession::RealTime,
            CollectionSession::ManualFetch,
        ] {
            assert_eq!(CollectionSession::parse(&session.as_string()), session);
        }
    }

    #[test]
    fn unknown_message_type_never_panics() {
        assert_eq!(MessageType::parse("hologram"), MessageType::Unknown);
        assert!(!MessageType::Unknown.is_media());
    }
}
