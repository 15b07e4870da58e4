use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use karere_relay::connection::{ConnectionState, SessionEvent};
use karere_relay::relay::{RelayHandle, ServerEvent};
use karere_relay::store::{SETTING_FIRST_LOGIN_COMPLETE, Store};
use karere_relay::sync::{SyncEngine, SyncRequest};
use karere_relay::types::{CollectionSession, DeliveryStatus, Message, MessageType};
use karere_relay::upstream::{
    MediaFile, RemoteChat, RemoteContact, RemoteGroupInfo, RemoteMessage, RemotePayload,
    UpstreamEvent, UpstreamService,
};

/// Upstream with a fixed per-chat history, counting network fetches.
struct FixedHistoryUpstream {
    history: HashMap<String, Vec<RemoteMessage>>,
    fetch_calls: AtomicUsize,
}

impl FixedHistoryUpstream {
    fn new(history: HashMap<String, Vec<RemoteMessage>>) -> Self {
        Self {
            history,
            fetch_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UpstreamService for FixedHistoryUpstream {
    async fn connect(&self) -> anyhow::Result<mpsc::Receiver<UpstreamEvent>> {
        anyhow::bail!("sync tests drive events directly")
    }

    async fn send_message(&self, _to: &str, _text: &str) -> anyhow::Result<String> {
        anyhow::bail!("not used")
    }

    async fn fetch_message_history(
        &self,
        jid: &str,
        limit: usize,
        _before: Option<i64>,
    ) -> anyhow::Result<Vec<RemoteMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut msgs = self.history.get(jid).cloned().unwrap_or_default();
        // Newest first, as the remote service returns them.
        msgs.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        msgs.truncate(limit);
        Ok(msgs)
    }

    async fn profile_picture(&self, _jid: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(Some(vec![0xFF, 0xD8]))
    }

    async fn group_metadata(&self, _jid: &str) -> anyhow::Result<Option<RemoteGroupInfo>> {
        Ok(None)
    }

    async fn fetch_media(&self, message: &RemoteMessage) -> anyhow::Result<MediaFile> {
        Ok(MediaFile {
            file_path: None,
            file_name: Some(format!("{}.jpg", message.id)),
            file_size: Some(1024),
            mime_type: Some("image/jpeg".to_string()),
        })
    }

    async fn contacts(&self) -> anyhow::Result<Vec<RemoteContact>> {
        Ok(Vec::new())
    }

    async fn contact_info(&self, jid: &str) -> anyhow::Result<Option<RemoteContact>> {
        Ok(Some(RemoteContact {
            jid: jid.to_string(),
            name: Some(format!("Contact {jid}")),
            phone: None,
            avatar: None,
        }))
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

fn text(id: &str, chat: &str, ts: i64) -> RemoteMessage {
    RemoteMessage {
        id: id.to_string(),
        chat_jid: chat.to_string(),
        from_me: false,
        timestamp: ts,
        payload: RemotePayload::Text(format!("message {id}")),
        sender_name: None,
        quoted_id: None,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    upstream: Arc<FixedHistoryUpstream>,
    events: broadcast::Sender<SessionEvent>,
    requests: mpsc::Sender<SyncRequest>,
    relay_rx: mpsc::UnboundedReceiver<ServerEvent>,
    _engine: tokio::task::JoinHandle<()>,
    _shutdown: watch::Sender<bool>,
    _state: watch::Sender<ConnectionState>,
}

async fn start_engine(history: HashMap<String, Vec<RemoteMessage>>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("sync.db");
    let store = Arc::new(Store::new(db.to_str().unwrap()).await.expect("store"));
    let upstream = Arc::new(FixedHistoryUpstream::new(history));

    let relay = RelayHandle::new();
    let (client_tx, relay_rx) = mpsc::unbounded_channel();
    assert!(relay.attach(client_tx));

    let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
    let (events, events_rx) = broadcast::channel(64);
    let (requests, requests_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = SyncEngine::new(store.clone(), upstream.clone(), relay, state_rx);
    let handle = tokio::spawn(engine.run(events_rx, requests_rx, shutdown_rx));

    Harness {
        _dir: dir,
        store,
        upstream,
        events,
        requests,
        relay_rx,
        _engine: handle,
        _shutdown: shutdown_tx,
        _state: state_tx,
    }
}

async fn wait_for_download_complete(h: &mut Harness) {
    loop {
        match h.relay_rx.recv().await.expect("relay event") {
            ServerEvent::DownloadComplete { .. } => return,
            _ => continue,
        }
    }
}

async fn wait_for_sync_complete(h: &mut Harness) {
    loop {
        match h.relay_rx.recv().await.expect("relay event") {
            ServerEvent::SyncComplete {} => return,
            _ => continue,
        }
    }
}

fn two_chat_history() -> (HashMap<String, Vec<RemoteMessage>>, Vec<RemoteChat>) {
    let chat1 = "alice@s.whatsapp.net";
    let chat2 = "build-group@g.us";
    let mut history = HashMap::new();
    history.insert(
        chat1.to_string(),
        vec![text("a1", chat1, 1000), text("a2", chat1, 2000), text("a3", chat1, 3000)],
    );
    history.insert(chat2.to_string(), vec![text("b1", chat2, 9000)]);
    let snapshot = vec![
        RemoteChat {
            jid: chat1.to_string(),
            name: Some("Alice".to_string()),
            last_message_ts: Some(3000),
            ..Default::default()
        },
        RemoteChat {
            jid: chat2.to_string(),
            name: Some("Build Group".to_string()),
            last_message_ts: Some(9000),
            ..Default::default()
        },
    ];
    (history, snapshot)
}

#[tokio::test(start_paused = true)]
async fn first_sync_imports_snapshot_into_the_cache() {
    let (history, snapshot) = two_chat_history();
    let mut h = start_engine(history).await;

    h.events
        .send(SessionEvent::StateChanged(ConnectionState::Open))
        .unwrap();
    h.events.send(SessionEvent::Snapshot(snapshot)).unwrap();
    wait_for_download_complete(&mut h).await;

    let chats = h.store.list_chats(10).await.unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].jid, "build-group@g.us");
    assert_eq!(chats[1].jid, "alice@s.whatsapp.net");
    // Contact name beats the raw chat name.
    assert_eq!(chats[1].name.as_deref(), Some("Contact alice@s.whatsapp.net"));

    let msgs = h.store.list_messages("alice@s.whatsapp.net", 10, 0).await.unwrap();
    assert_eq!(msgs.len(), 3);
    assert!(msgs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(msgs[0].collection, CollectionSession::InitialSync);

    assert_eq!(
        h.store
            .get_setting(SETTING_FIRST_LOGIN_COMPLETE)
            .await
            .unwrap()
            .as_deref(),
        Some("true")
    );
}

#[tokio::test(start_paused = true)]
async fn realtime_pushes_during_snapshot_wait_are_not_lost() {
    let (history, snapshot) = two_chat_history();
    let mut h = start_engine(history).await;

    h.events
        .send(SessionEvent::StateChanged(ConnectionState::Open))
        .unwrap();
    // Lands while the engine is still waiting for the snapshot.
    h.events
        .send(SessionEvent::Message(text("rt0", "carol@s.whatsapp.net", 9500)))
        .unwrap();
    h.events.send(SessionEvent::Snapshot(snapshot)).unwrap();

    let mut saw_push = false;
    loop {
        match h.relay_rx.recv().await.expect("relay event") {
            ServerEvent::NewMessage { id, .. } => {
                assert_eq!(id, "rt0");
                saw_push = true;
            }
            ServerEvent::DownloadComplete { .. } => break,
            _ => continue,
        }
    }
    assert!(saw_push, "buffered push must reach the client");

    let msg = h.store.get_message("rt0").await.unwrap().expect("stored");
    assert_eq!(msg.collection, CollectionSession::RealTime);
    // The snapshot import still ran in full.
    assert_eq!(h.store.list_chats(10).await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_passes_never_duplicate_messages() {
    let (history, snapshot) = two_chat_history();
    let mut h = start_engine(history).await;

    h.events
        .send(SessionEvent::StateChanged(ConnectionState::Open))
        .unwrap();
    h.events.send(SessionEvent::Snapshot(snapshot.clone())).unwrap();
    wait_for_download_complete(&mut h).await;

    // A reconnect triggers another pass over identical upstream data.
    h.events
        .send(SessionEvent::StateChanged(ConnectionState::Open))
        .unwrap();
    h.events.send(SessionEvent::Snapshot(snapshot)).unwrap();
    wait_for_sync_complete(&mut h).await;

    let one = h.store.list_messages("alice@s.whatsapp.net", 50, 0).await.unwrap();
    let two = h.store.list_messages("build-group@g.us", 50, 0).await.unwrap();
    assert_eq!(one.len(), 3);
    assert_eq!(two.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn incremental_rechecks_are_rate_limited_per_chat() {
    let chat = "alice@s.whatsapp.net";
    let mut history = HashMap::new();
    history.insert(chat.to_string(), vec![text("a1", chat, 1000)]);
    let h = start_engine(history).await;

    // Pre-seed the cache so the engine picks the incremental strategy.
    h.store
        .upsert_message(&Message {
            id: "a1".to_string(),
            chat_jid: chat.to_string(),
            from_me: false,
            message_type: MessageType::Text,
            content: Some("message a1".to_string()),
            timestamp: 1000,
            status: DeliveryStatus::Received,
            quoted_id: None,
            sender_name: None,
            collection: CollectionSession::InitialSync,
        })
        .await
        .unwrap();

    let mut h = h;
    h.requests.send(SyncRequest::Incremental).await.unwrap();
    wait_for_sync_complete(&mut h).await;
    assert_eq!(h.upstream.fetch_calls.load(Ordering::SeqCst), 1);

    // Second pass inside the per-chat floor does zero network fetches.
    h.requests.send(SyncRequest::Incremental).await.unwrap();
    wait_for_sync_complete(&mut h).await;
    assert_eq!(h.upstream.fetch_calls.load(Ordering::SeqCst), 1);

    let msgs = h.store.list_messages(chat, 10, 0).await.unwrap();
    assert_eq!(msgs.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn media_messages_get_a_media_row() {
    let chat = "pix@s.whatsapp.net";
    let mut history = HashMap::new();
    history.insert(
        chat.to_string(),
        vec![RemoteMessage {
            id: "img1".to_string(),
            chat_jid: chat.to_string(),
            from_me: false,
            timestamp: 4000,
            payload: RemotePayload::Image {
                caption: Some("sunset".to_string()),
            },
            sender_name: None,
            quoted_id: None,
        }],
    );
    let snapshot = vec![RemoteChat {
        jid: chat.to_string(),
        last_message_ts: Some(4000),
        ..Default::default()
    }];
    let mut h = start_engine(history).await;

    h.events
        .send(SessionEvent::StateChanged(ConnectionState::Open))
        .unwrap();
    h.events.send(SessionEvent::Snapshot(snapshot)).unwrap();
    wait_for_download_complete(&mut h).await;

    let media = h.store.get_media("img1").await.unwrap().expect("media row");
    assert_eq!(media.file_name.as_deref(), Some("img1.jpg"));
    assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));

    // Image captions surface as message content; the chat-list preview
    // for a non-text message still stays null.
    let msg = h.store.get_message("img1").await.unwrap().unwrap();
    assert_eq!(msg.content.as_deref(), Some("sunset"));
    let chats = h.store.list_chats(5).await.unwrap();
    assert_eq!(chats[0].last_message, None);
}

#[tokio::test(start_paused = true)]
async fn realtime_messages_are_stored_and_pushed() {
    let mut h = start_engine(HashMap::new()).await;
    let chat = "bob@s.whatsapp.net";

    h.events
        .send(SessionEvent::Message(text("rt1", chat, 7000)))
        .unwrap();

    loop {
        match h.relay_rx.recv().await.expect("relay event") {
            ServerEvent::NewMessage { from, body, from_me, .. } => {
                assert_eq!(from, chat);
                assert_eq!(body.as_deref(), Some("message rt1"));
                assert!(!from_me);
                break;
            }
            _ => continue,
        }
    }

    let msg = h.store.get_message("rt1").await.unwrap().expect("stored");
    assert_eq!(msg.collection, CollectionSession::RealTime);

    // Replay of the same push is deduplicated before any side effect.
    h.events
        .send(SessionEvent::Message(text("rt1", chat, 7000)))
        .unwrap();
    h.events
        .send(SessionEvent::Message(text("rt2", chat, 8000)))
        .unwrap();
    loop {
        if let ServerEvent::NewMessage { id, .. } = h.relay_rx.recv().await.expect("relay event") {
            assert_eq!(id, "rt2");
            break;
        }
    }
    assert_eq!(h.store.list_messages(chat, 10, 0).await.unwrap().len(), 2);
}
