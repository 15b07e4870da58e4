use serde::Serialize;

use super::message::MessageType;

/// A cached conversation. Created on first sight of a remote chat and
/// mutated by sync passes and new messages; never hard-deleted.
#[derive(Debug, Clone, Default)]
pub struct Chat {
    pub jid: String,
    pub name: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_ts: Option<i64>,
    pub last_message_type: Option<MessageType>,
    pub last_message_sender: Option<String>,
    pub unread_count: i32,
    pub archived: bool,
    pub avatar: Option<Vec<u8>>,
    /// Oldest timestamp covered by progressive history sync.
    pub history_baseline_ts: Option<i64>,
    pub last_synced_at: Option<i64>,
    pub history_complete: bool,
}

impl Chat {
    pub fn is_group(&self) -> bool {
        self.jid.ends_with("@g.us")
    }
}

/// Chat-list row shipped to the UI client. Contact data, where present,
/// takes precedence over raw chat metadata for the display name.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub jid: String,
    pub name: Option<String>,
    /// Preview of the latest message. Kept `null` for non-text messages,
    /// matching the historical behavior of the chat-list preview.
    #[serde(rename = "lastMessage")]
    pub last_message: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(rename = "unreadCount")]
    pub unread_count: i32,
    pub phone: Option<String>,
    /// Base64-encoded avatar image, contact picture first, the chat's
    /// own picture as fallback.
    #[serde(rename = "avatarBase64")]
    pub avatar_base64: Option<String>,
    pub archived: bool,
}
