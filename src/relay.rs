use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::store::Store;
use crate::supervisor::{HealthSummary, Supervisor};
use crate::sync::{SyncRequest, SyncStats};
use crate::types::{ChatSummary, CollectionSession, DeliveryStatus, Message, MessageType};
use crate::upstream::UpstreamService;

/// Inbound commands from the UI client. The set is closed; anything
/// else is answered with a typed `error` event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    GetInitialChats {},
    SendMessage {
        to: String,
        message: String,
    },
    GetMessageHistory {
        jid: String,
        limit: Option<i64>,
        offset: Option<i64>,
    },
    TypingStart {
        to: String,
    },
    TypingStop {
        to: String,
    },
    HealthCheck {},
    SyncContacts {},
    GetContactInfo {
        jid: String,
    },
}

/// Message row as shipped to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: String,
    pub text: Option<String>,
    #[serde(rename = "fromMe")]
    pub from_me: bool,
    pub timestamp: i64,
    pub status: DeliveryStatus,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "senderName")]
    pub sender_name: Option<String>,
}

impl From<Message> for MessageView {
    fn from(m: Message) -> Self {
        MessageView {
            id: m.id,
            text: m.content,
            from_me: m.from_me,
            timestamp: m.timestamp,
            status: m.status,
            message_type: m.message_type,
            sender_name: m.sender_name,
        }
    }
}

/// Outbound events. Best-effort: with no client attached they are
/// dropped, the store stays the durable source of truth.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Qr {
        url: String,
    },
    ConnectionStatus {
        status: String,
    },
    BaileysReady {},
    InitialChats {
        chats: Vec<ChatSummary>,
    },
    ChatsUpdated {
        chats: Vec<ChatSummary>,
    },
    #[serde(rename = "newMessage")]
    NewMessage {
        from: String,
        body: Option<String>,
        id: String,
        timestamp: i64,
        #[serde(rename = "fromMe")]
        from_me: bool,
    },
    MessageSent {
        to: String,
        message: String,
        #[serde(rename = "messageId")]
        message_id: String,
        timestamp: i64,
    },
    MessageHistory {
        jid: String,
        messages: Vec<MessageView>,
    },
    DownloadProgress {
        stage: String,
        progress: u32,
        stats: SyncStats,
    },
    DownloadComplete {
        stats: SyncStats,
    },
    SyncProgress {
        stage: String,
        progress: u32,
        stats: SyncStats,
    },
    SyncComplete {},
    ContactInfo {
        jid: String,
        name: Option<String>,
        phone: Option<String>,
        blocked: bool,
    },
    HealthStatus(HealthSummary),
    Error {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        details: Option<serde_json::Value>,
    },
}

impl ServerEvent {
    pub fn error(kind: &str, message: impl ToString) -> Self {
        ServerEvent::Error {
            kind: kind.to_string(),
            message: message.to_string(),
            details: None,
        }
    }
}

#[derive(Default)]
struct RelayState {
    client: Option<mpsc::UnboundedSender<ServerEvent>>,
    cached_chats: Option<Vec<ChatSummary>>,
    client_waiting: bool,
}

/// Clonable handle other components use to push events at the single
/// UI client and to manage the cached chat snapshot.
#[derive(Clone, Default)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
}

impl RelayHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_client(&self) -> bool {
        self.state.lock().unwrap().client.is_some()
    }

    /// Best-effort send; dropped when no client is attached.
    pub fn send(&self, event: ServerEvent) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.client {
            let _ = tx.send(event);
        }
    }

    /// Primes the snapshot a late client receives on connect and
    /// delivers it at once to a client already waiting for it.
    pub fn set_initial_chats(&self, chats: Vec<ChatSummary>) {
        let mut state = self.state.lock().unwrap();
        state.cached_chats = Some(chats.clone());
        if let Some(tx) = &state.client {
            let _ = tx.send(ServerEvent::InitialChats { chats });
            state.client_waiting = false;
        }
    }

    /// Invoked when the upstream session closes; the next snapshot must
    /// come from a fresh sync pass.
    pub fn clear_snapshot(&self) {
        self.state.lock().unwrap().cached_chats = None;
    }

    /// Registers the just-connected client's outbound queue, refusing
    /// when a client is already attached so a racing connect can never
    /// displace the active one. Sends the cached snapshot synchronously
    /// when one exists.
    pub fn attach(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.client.is_some() {
            return false;
        }
        match state.cached_chats.clone() {
            Some(chats) => {
                let _ = tx.send(ServerEvent::InitialChats { chats });
            }
            None => state.client_waiting = true,
        }
        state.client = Some(tx);
        true
    }

    pub fn detach(&self) {
        let mut state = self.state.lock().unwrap();
        state.client = None;
        state.client_waiting = false;
    }
}

/// Everything command dispatch can reach.
pub struct CommandContext {
    pub store: Arc<Store>,
    pub upstream: Arc<dyn UpstreamService>,
    pub supervisor: Arc<Supervisor>,
    pub sync_tx: mpsc::Sender<SyncRequest>,
    pub relay: RelayHandle,
}

/// WebSocket server holding at most one active UI client.
pub struct RelayServer {
    handle: RelayHandle,
    ctx: Arc<CommandContext>,
}

impl RelayServer {
    pub fn new(handle: RelayHandle, ctx: Arc<CommandContext>) -> Self {
        Self { handle, ctx }
    }

    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!(target: "Relay", "Listening on {:?}", listener.local_addr().ok());
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(target: "Relay", "Accept failed: {e}");
                        continue;
                    }
                },
                _ = shutdown.changed() => return,
            };
            if self.handle.has_client() {
                warn!(target: "Relay", "Rejecting second client from {peer}");
                drop(stream);
                continue;
            }
            let handle = self.handle.clone();
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, handle, ctx).await {
                    debug!(target: "Relay", "Client session ended: {e:#}");
                }
            });
        }
    }
}

async fn serve_client(
    stream: tokio::net::TcpStream,
    handle: RelayHandle,
    ctx: Arc<CommandContext>,
) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    // The accept loop's pre-check raced another connect; the registry
    // decides who won.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    if !handle.attach(tx) {
        warn!(target: "Relay", "Rejecting concurrent second client");
        let _ = ws.close(None).await;
        return Ok(());
    }
    let (mut sink, mut inbound) = ws.split();
    info!(target: "Relay", "UI client connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(target: "Relay", "Event serialization failed: {e}"),
            }
        }
    });

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let handle = handle.clone();
                let ctx = ctx.clone();
                // Dispatch off the read loop so a slow handler never
                // blocks inbound commands.
                tokio::spawn(async move {
                    let event = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                        Ok(cmd) => dispatch(cmd, &ctx).await,
                        Err(e) => Some(ServerEvent::error("invalid_command", e)),
                    };
                    if let Some(event) = event {
                        handle.send(event);
                    }
                });
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(target: "Relay", "Socket error: {e}");
                break;
            }
        }
    }

    handle.detach();
    writer.abort();
    info!(target: "Relay", "UI client disconnected");
    Ok(())
}

/// Exhaustive command dispatch; every failure path becomes an `error`
/// event, never a dropped connection.
pub async fn dispatch(cmd: ClientCommand, ctx: &CommandContext) -> Option<ServerEvent> {
    match cmd {
        ClientCommand::GetInitialChats {} => match ctx.store.list_chats(100).await {
            Ok(chats) => {
                ctx.relay.set_initial_chats(chats);
                None
            }
            Err(e) => Some(ServerEvent::error("get_initial_chats", e)),
        },
        ClientCommand::SendMessage { to, message } => Some(send_message(ctx, to, message).await),
        ClientCommand::GetMessageHistory { jid, limit, offset } => {
            let limit = limit.unwrap_or(50).clamp(1, 500);
            let offset = offset.unwrap_or(0).max(0);
            match ctx.store.list_messages(&jid, limit, offset).await {
                Ok(messages) => Some(ServerEvent::MessageHistory {
                    jid,
                    messages: messages.into_iter().map(MessageView::from).collect(),
                }),
                Err(e) => Some(ServerEvent::error("get_message_history", e)),
            }
        }
        ClientCommand::TypingStart { to } => match ctx.upstream.send_typing(&to, true).await {
            Ok(()) => None,
            Err(e) => Some(ServerEvent::error("typing_start", format!("{e:#}"))),
        },
        ClientCommand::TypingStop { to } => match ctx.upstream.send_typing(&to, false).await {
            Ok(()) => None,
            Err(e) => Some(ServerEvent::error("typing_stop", format!("{e:#}"))),
        },
        ClientCommand::HealthCheck {} => {
            Some(ServerEvent::HealthStatus(ctx.supervisor.run_health_checks().await))
        }
        ClientCommand::SyncContacts {} => match ctx.sync_tx.send(SyncRequest::Contacts).await {
            Ok(()) => None,
            Err(_) => Some(ServerEvent::error("sync_contacts", "sync engine unavailable")),
        },
        ClientCommand::GetContactInfo { jid } => contact_info(ctx, jid).await,
    }
}

/// Persists a placeholder row first, then reconciles its id with the
/// remote-confirmed one once the send goes through.
async fn send_message(ctx: &CommandContext, to: String, message: String) -> ServerEvent {
    let timestamp = Utc::now().timestamp_millis();
    let placeholder = format!("local-{timestamp}");
    let mut row = Message {
        id: placeholder.clone(),
        chat_jid: to.clone(),
        from_me: true,
        message_type: MessageType::Text,
        content: Some(message.clone()),
        timestamp,
        status: DeliveryStatus::Sent,
        quoted_id: None,
        sender_name: None,
        collection: CollectionSession::RealTime,
    };
    if let Err(e) = ctx.store.upsert_message(&row).await {
        return ServerEvent::error("send_message", e);
    }

    match ctx.upstream.send_message(&to, &message).await {
        Ok(message_id) => {
            if let Err(e) = ctx.store.reconcile_message_id(&placeholder, &message_id).await {
                warn!(target: "Relay", "Id reconciliation failed for {placeholder}: {e}");
            }
            ServerEvent::MessageSent {
                to,
                message,
                message_id,
                timestamp,
            }
        }
        Err(e) => {
            row.status = DeliveryStatus::Failed;
            if let Err(store_err) = ctx.store.upsert_message(&row).await {
                warn!(target: "Relay", "Failed-status update lost: {store_err}");
            }
            ServerEvent::error("send_message", format!("{e:#}"))
        }
    }
}

async fn contact_info(ctx: &CommandContext, jid: String) -> Option<ServerEvent> {
    match ctx.store.get_contact(&jid).await {
        Ok(Some(contact)) => {
            return Some(ServerEvent::ContactInfo {
                jid: contact.jid,
                name: contact.name,
                phone: contact.phone,
                blocked: contact.blocked,
            });
        }
        Ok(None) => {}
        Err(e) => return Some(ServerEvent::error("get_contact_info", e)),
    }
    // Cache miss: ask upstream and remember the answer.
    match ctx.upstream.contact_info(&jid).await {
        Ok(Some(remote)) => {
            let contact = crate::types::Contact {
                jid: remote.jid.clone(),
                name: remote.name.clone(),
                phone: remote.phone.clone(),
                avatar: remote.avatar,
                blocked: false,
            };
            if let Err(e) = ctx.store.upsert_contact(&contact).await {
                warn!(target: "Relay", "Contact cache write failed: {e}");
            }
            Some(ServerEvent::ContactInfo {
                jid: remote.jid,
                name: remote.name,
                phone: remote.phone,
                blocked: false,
            })
        }
        Ok(None) => Some(ServerEvent::error("get_contact_info", "unknown contact")),
        Err(e) => Some(ServerEvent::error("get_contact_info", format!("{e:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_parse_from_envelope() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"type": "get_initial_chats", "data": {}})).unwrap();
        assert!(matches!(cmd, ClientCommand::GetInitialChats {}));

        let cmd: ClientCommand = serde_json::from_value(
            json!({"type": "send_message", "data": {"to": "x@s.whatsapp.net", "message": "hi"}}),
        )
        .unwrap();
        match cmd {
            ClientCommand::SendMessage { to, message } => {
                assert_eq!(to, "x@s.whatsapp.net");
                assert_eq!(message, "hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_a_parse_error() {
        let err = serde_json::from_value::<ClientCommand>(
            json!({"type": "reboot_universe", "data": {}}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn events_serialize_with_expected_names() {
        let event = ServerEvent::NewMessage {
            from: "a@s.whatsapp.net".to_string(),
            body: Some("hello".to_string()),
            id: "m1".to_string(),
            timestamp: 42,
            from_me: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "newMessage");
        assert_eq!(value["data"]["from"], "a@s.whatsapp.net");
        assert_eq!(value["data"]["fromMe"], false);

        let err = ServerEvent::error("invalid_command", "nope");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["type"], "invalid_command");
    }

    #[test]
    fn late_snapshot_reaches_waiting_client() {
        let handle = RelayHandle::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(handle.attach(tx));
        // Nothing cached yet, so nothing was delivered on attach.
        assert!(rx.try_recv().is_err());
        assert!(handle.state.lock().unwrap().client_waiting);

        handle.set_initial_chats(vec![]);
        match rx.try_recv().unwrap() {
            ServerEvent::InitialChats { chats } => assert!(chats.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!handle.state.lock().unwrap().client_waiting);
    }

    #[test]
    fn cached_snapshot_is_sent_synchronously_on_attach() {
        let handle = RelayHandle::new();
        handle.set_initial_chats(vec![ChatSummary {
            jid: "a@s.whatsapp.net".to_string(),
            name: None,
            last_message: Some("hey".to_string()),
            timestamp: Some(1),
            unread_count: 0,
            phone: None,
            avatar_base64: None,
            archived: false,
        }]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(handle.attach(tx));
        match rx.try_recv().unwrap() {
            ServerEvent::InitialChats { chats } => assert_eq!(chats.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }

        handle.detach();
        handle.send(ServerEvent::SyncComplete {});
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn racing_attach_cannot_displace_the_active_client() {
        let handle = RelayHandle::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        assert!(handle.attach(tx1));
        // A second connect that slipped past the accept-loop check.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        assert!(!handle.attach(tx2));

        handle.send(ServerEvent::SyncComplete {});
        assert!(matches!(
            rx1.try_recv().unwrap(),
            ServerEvent::SyncComplete {}
        ));
        assert!(rx2.try_recv().is_err());

        // The winner detaching frees the slot for the next client.
        handle.detach();
        let (tx3, _rx3) = mpsc::unbounded_channel();
        assert!(handle.attach(tx3));
    }
}
