use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::MessageType;

/// Why the upstream session went away. A logout is an intentional,
/// terminal signal; everything else is transient and retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    StreamError(String),
    Network(String),
}

impl DisconnectReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

/// Typed events produced by the upstream session, consumed in order by
/// the connection manager's control loop.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Open,
    Close(DisconnectReason),
    Qr { url: String },
    Message(RemoteMessage),
    Snapshot(Vec<RemoteChat>),
}

/// A conversation as the remote service reports it.
#[derive(Debug, Clone, Default)]
pub struct RemoteChat {
    pub jid: String,
    pub name: Option<String>,
    pub last_message_ts: Option<i64>,
    pub unread_count: i32,
    pub archived: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteContact {
    pub jid: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub avatar: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RemoteGroupInfo {
    pub jid: String,
    pub subject: String,
}

/// A fetched media payload's metadata.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
}

/// One message as the remote service reports it, already narrowed to a
/// known payload shape at the boundary.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: String,
    pub chat_jid: String,
    pub from_me: bool,
    pub timestamp: i64,
    pub payload: RemotePayload,
    pub sender_name: Option<String>,
    pub quoted_id: Option<String>,
}

/// Closed set of payload shapes the relay understands. Anything the
/// remote library hands us that doesn't match one of these is
/// classified as `Unknown` rather than rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePayload {
    Text(String),
    ExtendedText(String),
    Image { caption: Option<String> },
    Video { caption: Option<String> },
    Audio,
    Document { file_name: Option<String> },
    Sticker,
    Location,
    ContactCard,
    Reaction { emoji: String },
    Poll { name: Option<String> },
    Unknown,
}

impl RemotePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            RemotePayload::Text(_) | RemotePayload::ExtendedText(_) => MessageType::Text,
            RemotePayload::Image { .. } => MessageType::Image,
            RemotePayload::Video { .. } => MessageType::Video,
            RemotePayload::Audio => MessageType::Audio,
            RemotePayload::Document { .. } => MessageType::Document,
            RemotePayload::Sticker => MessageType::Sticker,
            RemotePayload::Location => MessageType::Location,
            RemotePayload::ContactCard => MessageType::Contact,
            RemotePayload::Reaction { .. } => MessageType::Reaction,
            RemotePayload::Poll { .. } => MessageType::Poll,
            RemotePayload::Unknown => MessageType::Unknown,
        }
    }

    /// Display text for the UI. Only the known text-bearing shapes
    /// (plain text, extended text, image/video caption) yield content;
    /// everything else is `None`, never an empty string.
    pub fn display_text(&self) -> Option<String> {
        match self {
            RemotePayload::Text(text) | RemotePayload::ExtendedText(text) => Some(text.clone()),
            RemotePayload::Image { caption } | RemotePayload::Video { caption } => caption.clone(),
            _ => None,
        }
    }

    /// Narrows a loosely-typed upstream message body into the closed
    /// payload set. Used by protocol adapters at the boundary.
    pub fn from_value(body: &Value) -> RemotePayload {
        if let Some(text) = body.get("conversation").and_then(Value::as_str) {
            return RemotePayload::Text(text.to_string());
        }
        if let Some(text) = body
            .pointer("/extendedTextMessage/text")
            .and_then(Value::as_str)
        {
            return RemotePayload::ExtendedText(text.to_string());
        }
        if let Some(img) = body.get("imageMessage") {
            return RemotePayload::Image {
                caption: img.get("caption").and_then(Value::as_str).map(String::from),
            };
        }
        if let Some(vid) = body.get("videoMessage") {
            return RemotePayload::Video {
                caption: vid.get("caption").and_then(Value::as_str).map(String::from),
            };
        }
        if body.get("audioMessage").is_some() {
            return RemotePayload::Audio;
        }
        if let Some(doc) = body.get("documentMessage") {
            return RemotePayload::Document {
                file_name: doc.get("fileName").and_then(Value::as_str).map(String::from),
            };
        }
        if body.get("stickerMessage").is_some() {
            return RemotePayload::Sticker;
        }
        if body.get("locationMessage").is_some() {
            return RemotePayload::Location;
        }
        if body.get("contactMessage").is_some() || body.get("contactsArrayMessage").is_some() {
            return RemotePayload::ContactCard;
        }
        if let Some(reaction) = body.pointer("/reactionMessage/text").and_then(Value::as_str) {
            return RemotePayload::Reaction {
                emoji: reaction.to_string(),
            };
        }
        if let Some(poll) = body.get("pollCreationMessage") {
            return RemotePayload::Poll {
                name: poll.get("name").and_then(Value::as_str).map(String::from),
            };
        }
        RemotePayload::Unknown
    }
}

/// Boundary to the external messaging-protocol library. The relay owns
/// everything behind this trait; the library owns the wire protocol,
/// credentials and pairing.
#[async_trait]
pub trait UpstreamService: Send + Sync {
    /// Opens the session using persisted credentials and hands back the
    /// ordered event stream for this connection attempt.
    async fn connect(&self) -> anyhow::Result<mpsc::Receiver<UpstreamEvent>>;

    /// Sends a text message, returning the remote-confirmed message id.
    async fn send_message(&self, to: &str, text: &str) -> anyhow::Result<String>;

    /// Newest-first history page for one chat. `before` bounds the page
    /// at an exclusive epoch-millis timestamp.
    async fn fetch_message_history(
        &self,
        jid: &str,
        limit: usize,
        before: Option<i64>,
    ) -> anyhow::Result<Vec<RemoteMessage>>;

    async fn profile_picture(&self, jid: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn group_metadata(&self, jid: &str) -> anyhow::Result<Option<RemoteGroupInfo>>;

    async fn fetch_media(&self, message: &RemoteMessage) -> anyhow::Result<MediaFile>;

    async fn contacts(&self) -> anyhow::Result<Vec<RemoteContact>>;

    async fn contact_info(&self, jid: &str) -> anyhow::Result<Option<RemoteContact>>;

    async fn send_typing(&self, to: &str, typing: bool) -> anyhow::Result<()>;

    /// Asks the upstream to push its initial conversation snapshot if it
    /// hasn't already.
    async fn request_history_snapshot(&self) -> anyhow::Result<()>;

    /// Wipes persisted credential material after an authoritative
    /// logout, so the next connect starts a fresh pairing flow.
    async fn clear_credentials(&self) -> anyhow::Result<()>;
}

/// Placeholder upstream used until a protocol backend is linked in.
/// Every session operation reports the service as unavailable; the
/// relay and local cache keep working.
pub struct DetachedUpstream;

#[async_trait]
impl UpstreamService for DetachedUpstream {
    async fn connect(&self) -> anyhow::Result<mpsc::Receiver<UpstreamEvent>> {
        Err(anyhow::anyhow!("no messaging backend linked"))
    }

    async fn send_message(&self, _to: &str, _text: &str) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("no messaging backend linked"))
    }

    async fn fetch_message_history(
        &self,
        _jid: &str,
        _limit: usize,
        _before: Option<i64>,
    ) -> anyhow::Result<Vec<RemoteMessage>> {
        Err(anyhow::anyhow!("no messaging backend linked"))
    }

    async fn profile_picture(&self, _jid: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn group_metadata(&self, _jid: &str) -> anyhow::Result<Option<RemoteGroupInfo>> {
        Ok(None)
    }

    async fn fetch_media(&self, _message: &RemoteMessage) -> anyhow::Result<MediaFile> {
        Err(anyhow::anyhow!("no messaging backend linked"))
    }

    async fn contacts(&self) -> anyhow::Result<Vec<RemoteContact>> {
        Ok(Vec::new())
    }

    async fn contact_info(&self, _jid: &str) -> anyhow::Result<Option<RemoteContact>> {
        Ok(None)
    }

    async fn send_typing(&self, _to: &str, _typing: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn request_history_snapshot(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear_credentials(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_known_payload_shapes() {
        let text = RemotePayload::from_value(&json!({"conversation": "hi"}));
        assert_eq!(text.display_text().as_deref(), Some("hi"));
        assert_eq!(text.message_type(), MessageType::Text);

        let extended =
            RemotePayload::from_value(&json!({"extendedTextMessage": {"text": "linked"}}));
        assert_eq!(extended.display_text().as_deref(), Some("linked"));

        let captioned =
            RemotePayload::from_value(&json!({"imageMessage": {"caption": "look"}}));
        assert_eq!(captioned.display_text().as_deref(), Some("look"));
        assert_eq!(captioned.message_type(), MessageType::Image);
    }

    #[test]
    fn unmatched_shapes_are_unknown_with_null_text() {
        let odd = RemotePayload::from_value(&json!({"templateMessage": {}}));
        assert_eq!(odd, RemotePayload::Unknown);
        assert_eq!(odd.display_text(), None);

        // A bare image has no caption but is still typed, not "".
        let image = RemotePayload::from_value(&json!({"imageMessage": {}}));
        assert_eq!(image.message_type(), MessageType::Image);
        assert_eq!(image.display_text(), None);
    }
}
