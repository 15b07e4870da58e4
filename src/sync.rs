use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::connection::{ConnectionState, SessionEvent};
use crate::relay::{RelayHandle, ServerEvent};
use crate::store::{SETTING_FIRST_LOGIN_COMPLETE, SETTING_LAST_SYNC_TS, Store};
use crate::types::{Chat, CollectionSession, Contact, DeliveryStatus, Media, Message};
use crate::upstream::{RemoteChat, RemoteContact, RemoteMessage, UpstreamService};

/// First-sync caps: per-chat message ceiling and history page size.
pub const FIRST_SYNC_MESSAGE_CAP: usize = 500;
pub const HISTORY_BATCH_SIZE: usize = 50;
/// How long first-sync waits for the upstream to push its snapshot
/// before requesting one.
pub const SNAPSHOT_WAIT: Duration = Duration::from_secs(30);
/// Incremental sync: per-chat poll floor and recent-window size.
pub const CHAT_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const INCREMENTAL_WINDOW: usize = 20;
/// Progress events fire every this many processed chats.
const PROGRESS_EVERY: usize = 5;

/// Work requests accepted while the engine idles between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    Incremental,
    Contacts,
}

/// Running totals carried by progress events.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncStats {
    pub processed: usize,
    pub total: usize,
    pub messages: usize,
    pub contacts: usize,
    pub avatars: usize,
}

impl SyncStats {
    fn percent(&self) -> u32 {
        if self.total == 0 {
            100
        } else {
            (self.processed * 100 / self.total) as u32
        }
    }
}

/// Decides what to fetch on every `open` transition, paginates history
/// against the local high-water marks and reports progress to the relay.
pub struct SyncEngine {
    store: Arc<Store>,
    upstream: Arc<dyn UpstreamService>,
    relay: RelayHandle,
    state: watch::Receiver<ConnectionState>,
    /// Per-chat poll floor for incremental passes.
    last_checked: HashMap<String, Instant>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        upstream: Arc<dyn UpstreamService>,
        relay: RelayHandle,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            store,
            upstream,
            relay,
            state,
            last_checked: HashMap::new(),
        }
    }

    fn is_open(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    /// Jittered pause between per-chat network calls. Protects against
    /// upstream throttling; removing it risks a rate-limit ban.
    async fn pace(&self) {
        let ms = rand::rng().random_range(150..=200);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Main loop: reacts to connection transitions, real-time messages
    /// and queued work requests until the channels close or shutdown.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<SessionEvent>,
        mut requests: mpsc::Receiver<SyncRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                req = requests.recv() => match req {
                    Some(SyncRequest::Incremental) => {
                        if self.is_open()
                            && let Err(e) = self.incremental_sync().await
                        {
                            warn!(target: "Sync", "Incremental pass failed: {e}");
                        }
                    }
                    Some(SyncRequest::Contacts) => {
                        if let Err(e) = self.sync_contacts().await {
                            warn!(target: "Sync", "Contact sync failed: {e}");
                        }
                    }
                    None => return,
                },
                ev = events.recv() => match ev {
                    Ok(SessionEvent::StateChanged(ConnectionState::Open)) => {
                        self.run_pass(&mut events).await;
                    }
                    Ok(SessionEvent::Message(msg)) => {
                        self.handle_realtime(msg).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "Sync", "Dropped {n} session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Strategy selection: bulk import when the cache is empty,
    /// otherwise a delta pass.
    async fn run_pass(&mut self, events: &mut broadcast::Receiver<SessionEvent>) {
        let empty = match self.store.chat_count().await {
            Ok(n) => n == 0,
            Err(e) => {
                warn!(target: "Sync", "Cannot read chat count: {e}");
                return;
            }
        };
        let result = if empty {
            self.first_sync(events).await
        } else {
            self.incremental_sync().await
        };
        if let Err(e) = result {
            warn!(target: "Sync", "Sync pass aborted: {e}");
        }
    }

    /// One-time bulk import: waits (bounded) for the pushed snapshot,
    /// then walks every discovered chat, paginating history up to the
    /// per-chat cap and fetching contacts, avatars and media as it goes.
    async fn first_sync(
        &mut self,
        events: &mut broadcast::Receiver<SessionEvent>,
    ) -> anyhow::Result<()> {
        info!(target: "Sync", "Starting first sync");
        let mut pending = Vec::new();
        let snapshot = self.await_snapshot(events, &mut pending).await;
        // Real-time pushes that raced the snapshot wait are replayed,
        // whether or not a snapshot arrived.
        for msg in pending {
            self.handle_realtime(msg).await;
        }
        let Some(snapshot) = snapshot else {
            warn!(target: "Sync", "No conversation snapshot arrived, skipping first sync");
            return Ok(());
        };

        let mut stats = SyncStats {
            total: snapshot.len(),
            ..Default::default()
        };
        self.relay.send(ServerEvent::DownloadProgress {
            stage: "starting".to_string(),
            progress: 0,
            stats,
        });

        for chat in snapshot {
            if !self.is_open() {
                anyhow::bail!("connection lost during first sync");
            }
            let jid = chat.jid.clone();
            if let Err(e) = self.import_chat(&chat, &mut stats).await {
                // One chat never aborts the batch.
                warn!(target: "Sync", "Import of {jid} failed: {e}");
            }
            stats.processed += 1;
            if stats.processed % PROGRESS_EVERY == 0 {
                self.relay.send(ServerEvent::DownloadProgress {
                    stage: "downloading".to_string(),
                    progress: stats.percent(),
                    stats,
                });
            }
            self.pace().await;
        }

        let now = Utc::now().timestamp_millis();
        self.store.set_setting(SETTING_FIRST_LOGIN_COMPLETE, "true").await?;
        self.store.set_setting(SETTING_LAST_SYNC_TS, &now.to_string()).await?;

        self.relay.send(ServerEvent::DownloadComplete { stats });
        self.push_chat_list(true).await?;
        info!(
            target: "Sync",
            "First sync complete: {} chats, {} messages, {} contacts",
            stats.processed, stats.messages, stats.contacts
        );
        Ok(())
    }

    /// Waits up to [`SNAPSHOT_WAIT`] for the upstream's pushed snapshot;
    /// if nothing arrives, requests one and waits again. Real-time
    /// messages seen while waiting are buffered into `pending` for the
    /// caller to replay, never dropped.
    async fn await_snapshot(
        &self,
        events: &mut broadcast::Receiver<SessionEvent>,
        pending: &mut Vec<RemoteMessage>,
    ) -> Option<Vec<RemoteChat>> {
        for requested in [false, true] {
            if requested && self.upstream.request_history_snapshot().await.is_err() {
                return None;
            }
            let deadline = Instant::now() + SNAPSHOT_WAIT;
            loop {
                let ev = tokio::time::timeout_at(deadline, events.recv()).await;
                match ev {
                    Ok(Ok(SessionEvent::Snapshot(chats))) => return Some(chats),
                    Ok(Ok(SessionEvent::Message(msg))) => pending.push(msg),
                    Ok(Ok(_)) => continue,
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                    Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                    Err(_) => break, // timed out, maybe request and retry
                }
            }
        }
        None
    }

    async fn import_chat(&self, chat: &RemoteChat, stats: &mut SyncStats) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        self.store
            .upsert_chat(&Chat {
                jid: chat.jid.clone(),
                name: chat.name.clone(),
                unread_count: chat.unread_count,
                archived: chat.archived,
                last_message_ts: chat.last_message_ts,
                history_baseline_ts: Some(now),
                last_synced_at: Some(now),
                ..Default::default()
            })
            .await?;

        if let Ok(Some(contact)) = self.upstream.contact_info(&chat.jid).await {
            self.upsert_remote_contact(&contact).await;
            stats.contacts += 1;
        }
        if let Ok(Some(avatar)) = self.upstream.profile_picture(&chat.jid).await {
            if self.store.set_chat_avatar(&chat.jid, avatar).await.is_ok() {
                stats.avatars += 1;
            }
        }

        let complete = self
            .download_history(&chat.jid, CollectionSession::InitialSync, stats)
            .await?;
        self.store
            .mark_chat_synced(&chat.jid, Utc::now().timestamp_millis(), complete)
            .await?;
        Ok(())
    }

    /// Paginates one chat's history newest-first in batches, stopping at
    /// the cap, on a short batch, or when a whole batch is already
    /// cached (idempotent stop, not an error). Returns whether the
    /// chat's history was exhausted.
    async fn download_history(
        &self,
        jid: &str,
        session: CollectionSession,
        stats: &mut SyncStats,
    ) -> anyhow::Result<bool> {
        let mut fetched = 0usize;
        let mut before: Option<i64> = None;

        while fetched < FIRST_SYNC_MESSAGE_CAP {
            if !self.is_open() {
                anyhow::bail!("connection lost during history download");
            }
            let batch = self
                .upstream
                .fetch_message_history(jid, HISTORY_BATCH_SIZE, before)
                .await?;
            let short_batch = batch.len() < HISTORY_BATCH_SIZE;
            let mut new_in_batch = 0usize;

            for remote in &batch {
                before = Some(before.map_or(remote.timestamp, |b: i64| b.min(remote.timestamp)));
                // Dedup before any side effect keeps retried passes
                // idempotent.
                if self.store.get_message(&remote.id).await?.is_some() {
                    continue;
                }
                new_in_batch += 1;
                self.persist_remote(remote, session.clone(), stats).await;
            }

            fetched += batch.len();
            if short_batch || (!batch.is_empty() && new_in_batch == 0) {
                return Ok(true);
            }
            if batch.is_empty() {
                return Ok(true);
            }
            self.pace().await;
        }
        Ok(false)
    }

    /// Stores one remote message; storage failure is skip-and-continue,
    /// media failure downgrades to a message without its media row.
    async fn persist_remote(
        &self,
        remote: &RemoteMessage,
        session: CollectionSession,
        stats: &mut SyncStats,
    ) {
        let msg = Message {
            id: remote.id.clone(),
            chat_jid: remote.chat_jid.clone(),
            from_me: remote.from_me,
            message_type: remote.payload.message_type(),
            content: remote.payload.display_text(),
            timestamp: remote.timestamp,
            status: if remote.from_me {
                DeliveryStatus::Sent
            } else {
                DeliveryStatus::Received
            },
            quoted_id: remote.quoted_id.clone(),
            sender_name: remote.sender_name.clone(),
            collection: session,
        };
        if let Err(e) = self.store.upsert_message(&msg).await {
            warn!(target: "Sync", "Skipping message {}: {e}", msg.id);
            return;
        }
        stats.messages += 1;

        if msg.message_type.is_media() {
            match self.upstream.fetch_media(remote).await {
                Ok(file) => {
                    let media = Media {
                        id: format!("media-{}", msg.id),
                        message_id: msg.id.clone(),
                        file_path: file.file_path,
                        file_name: file.file_name,
                        file_size: file.file_size,
                        mime_type: file.mime_type,
                    };
                    if let Err(e) = self.store.upsert_media(&media).await {
                        warn!(target: "Sync", "Media row for {} not stored: {e}", msg.id);
                    }
                }
                Err(e) => {
                    debug!(target: "Sync", "Media fetch failed for {}: {e:#}", msg.id);
                }
            }
        }
    }

    /// Delta pass over every known chat, bounded by the per-chat poll
    /// floor and the local high-water mark.
    async fn incremental_sync(&mut self) -> anyhow::Result<()> {
        let session = CollectionSession::ProgressiveSync(Utc::now().timestamp_millis());
        let jids = self.store.all_chat_jids().await?;
        let mut stats = SyncStats {
            total: jids.len(),
            ..Default::default()
        };
        let mut changed = false;

        for jid in jids {
            stats.processed += 1;
            if let Some(checked) = self.last_checked.get(&jid)
                && checked.elapsed() < CHAT_RECHECK_INTERVAL
            {
                continue;
            }
            if !self.is_open() {
                anyhow::bail!("connection lost during incremental sync");
            }
            self.last_checked.insert(jid.clone(), Instant::now());

            match self.sync_chat_delta(&jid, &session, &mut stats).await {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(e) => warn!(target: "Sync", "Delta for {jid} failed: {e}"),
            }

            if stats.processed % PROGRESS_EVERY == 0 {
                self.relay.send(ServerEvent::SyncProgress {
                    stage: "syncing".to_string(),
                    progress: stats.percent(),
                    stats,
                });
            }
            self.pace().await;
        }

        let now = Utc::now().timestamp_millis();
        self.store.set_setting(SETTING_LAST_SYNC_TS, &now.to_string()).await?;
        self.relay.send(ServerEvent::SyncComplete {});
        if changed {
            self.push_chat_list(false).await?;
        }
        debug!(target: "Sync", "Incremental pass done, {} new messages", stats.messages);
        Ok(())
    }

    /// Returns whether anything new landed for this chat.
    async fn sync_chat_delta(
        &self,
        jid: &str,
        session: &CollectionSession,
        stats: &mut SyncStats,
    ) -> anyhow::Result<bool> {
        let high_water = self.store.newest_message_ts(jid).await?.unwrap_or(0);
        let recent = self
            .upstream
            .fetch_message_history(jid, INCREMENTAL_WINDOW, None)
            .await?;

        let before = stats.messages;
        for remote in &recent {
            if remote.timestamp <= high_water {
                continue;
            }
            if self.store.get_message(&remote.id).await?.is_some() {
                continue;
            }
            self.persist_remote(remote, session.clone(), stats).await;
        }

        // Group subjects drift independently of message flow.
        if jid.ends_with("@g.us")
            && let Ok(Some(group)) = self.upstream.group_metadata(jid).await
        {
            self.store.set_chat_name(jid, &group.subject).await?;
        }
        self.store
            .mark_chat_synced(jid, Utc::now().timestamp_millis(), true)
            .await?;
        Ok(stats.messages > before)
    }

    /// A message pushed by the live session, outside any sync pass.
    async fn handle_realtime(&self, remote: RemoteMessage) {
        match self.store.get_message(&remote.id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(target: "Sync", "Dedup check failed for {}: {e}", remote.id);
                return;
            }
        }
        let mut stats = SyncStats::default();
        self.persist_remote(&remote, CollectionSession::RealTime, &mut stats).await;
        if !remote.from_me
            && let Err(e) = self.store.increment_unread(&remote.chat_jid).await
        {
            warn!(target: "Sync", "Unread bump failed for {}: {e}", remote.chat_jid);
        }
        self.relay.send(ServerEvent::NewMessage {
            from: remote.chat_jid.clone(),
            body: remote.payload.display_text(),
            id: remote.id.clone(),
            timestamp: remote.timestamp,
            from_me: remote.from_me,
        });
    }

    /// Full refresh of the remote address book, independent of chats.
    async fn sync_contacts(&self) -> anyhow::Result<()> {
        let contacts = self.upstream.contacts().await?;
        info!(target: "Sync", "Upserting {} contacts", contacts.len());
        for contact in &contacts {
            self.upsert_remote_contact(contact).await;
        }
        self.push_chat_list(false).await?;
        Ok(())
    }

    async fn upsert_remote_contact(&self, remote: &RemoteContact) {
        let contact = Contact {
            jid: remote.jid.clone(),
            name: remote.name.clone(),
            phone: remote.phone.clone(),
            avatar: remote.avatar.clone(),
            blocked: false,
        };
        if let Err(e) = self.store.upsert_contact(&contact).await {
            warn!(target: "Sync", "Contact upsert failed for {}: {e}", contact.jid);
        }
    }

    /// Ships a fresh chat list; `initial` also primes the snapshot a
    /// late-connecting client receives.
    async fn push_chat_list(&self, initial: bool) -> anyhow::Result<()> {
        let chats = self.store.list_chats(100).await?;
        if initial {
            self.relay.set_initial_chats(chats);
        } else {
            self.relay.send(ServerEvent::ChatsUpdated { chats });
        }
        Ok(())
    }
}
