use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use super::error::{Result, StoreError};
use super::schema::{chats, contacts, media, messages, settings};
use crate::types::{
    Chat, ChatSummary, CollectionSession, Contact, DeliveryStatus, Media, Message, MessageType,
};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Messages older than this are removed by [`Store::cleanup`].
const RETENTION_DAYS: i64 = 180;

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Durable cache of chats, messages, contacts, media metadata and
/// key/value settings. All writes are idempotent upserts keyed by
/// natural identifiers; blocking diesel work is offloaded to the
/// blocking thread pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Queryable)]
struct MessageRow {
    id: String,
    chat_jid: String,
    from_me: bool,
    msg_type: String,
    content: Option<String>,
    timestamp: i64,
    status: String,
    quoted_id: Option<String>,
    sender_name: Option<String>,
    collection_session: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            chat_jid: row.chat_jid,
            from_me: row.from_me,
            message_type: MessageType::parse(&row.msg_type),
            content: row.content,
            timestamp: row.timestamp,
            status: DeliveryStatus::parse(&row.status),
            quoted_id: row.quoted_id,
            sender_name: row.sender_name,
            collection: CollectionSession::parse(&row.collection_session),
        }
    }
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let migration_pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = migration_pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))??;

        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> QueryResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            f(&mut conn).map_err(|source| StoreError::Query { op, source })
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    /// Trivial query used by the supervisor's health check.
    pub async fn ping(&self) -> Result<()> {
        self.with_conn("ping", |conn| sql_query("SELECT 1").execute(conn).map(|_| ()))
            .await
    }

    pub async fn upsert_chat(&self, chat: &Chat) -> Result<()> {
        let c = chat.clone();
        self.with_conn("upsert_chat", move |conn| {
            let last_type = c.last_message_type.map(|t| t.as_str());
            let values = (
                chats::name.eq(c.name.as_deref()),
                chats::last_message_text.eq(c.last_message_text.as_deref()),
                chats::last_message_ts.eq(c.last_message_ts),
                chats::last_message_type.eq(last_type),
                chats::last_message_sender.eq(c.last_message_sender.as_deref()),
                chats::unread_count.eq(c.unread_count),
                chats::archived.eq(c.archived),
                chats::avatar.eq(c.avatar.as_deref()),
                chats::history_baseline_ts.eq(c.history_baseline_ts),
                chats::last_synced_at.eq(c.last_synced_at),
                chats::history_complete.eq(c.history_complete),
            );
            diesel::insert_into(chats::table)
                .values((chats::jid.eq(c.jid.as_str()), values))
                .on_conflict(chats::jid)
                .do_update()
                .set(values)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Inserts or replaces a message and advances the owning chat's
    /// last-message pointer in the same transaction. Re-inserting an
    /// existing id replaces the row (latest status wins), never
    /// duplicates it.
    pub async fn upsert_message(&self, msg: &Message) -> Result<()> {
        let m = msg.clone();
        self.with_conn("upsert_message", move |conn| {
            conn.transaction(|conn| {
                // The owning chat may not have been seen yet (real-time
                // message for a brand new conversation).
                diesel::insert_or_ignore_into(chats::table)
                    .values(chats::jid.eq(m.chat_jid.as_str()))
                    .execute(conn)?;

                let session = m.collection.as_string();
                diesel::insert_into(messages::table)
                    .values((
                        messages::id.eq(m.id.as_str()),
                        messages::chat_jid.eq(m.chat_jid.as_str()),
                        messages::from_me.eq(m.from_me),
                        messages::msg_type.eq(m.message_type.as_str()),
                        messages::content.eq(m.content.as_deref()),
                        messages::timestamp.eq(m.timestamp),
                        messages::status.eq(m.status.as_str()),
                        messages::quoted_id.eq(m.quoted_id.as_deref()),
                        messages::sender_name.eq(m.sender_name.as_deref()),
                        messages::collection_session.eq(session.as_str()),
                    ))
                    .on_conflict(messages::id)
                    .do_update()
                    .set(messages::status.eq(m.status.as_str()))
                    .execute(conn)?;

                diesel::update(
                    chats::table.filter(chats::jid.eq(m.chat_jid.as_str())).filter(
                        chats::last_message_ts
                            .le(m.timestamp)
                            .or(chats::last_message_ts.is_null().nullable()),
                    ),
                )
                .set((
                    chats::last_message_text.eq(m.content.as_deref()),
                    chats::last_message_ts.eq(m.timestamp),
                    chats::last_message_type.eq(m.message_type.as_str()),
                    chats::last_message_sender.eq(m.sender_name.as_deref()),
                ))
                .execute(conn)?;

                Ok(())
            })
        })
        .await
    }

    /// Replaces a locally generated placeholder id with the
    /// remote-confirmed one after a successful send.
    pub async fn reconcile_message_id(&self, placeholder: &str, confirmed: &str) -> Result<()> {
        let (old, new) = (placeholder.to_string(), confirmed.to_string());
        self.with_conn("reconcile_message_id", move |conn| {
            diesel::update(messages::table.filter(messages::id.eq(old.as_str())))
                .set(messages::id.eq(new.as_str()))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.with_conn("get_message", move |conn| {
            messages::table
                .filter(messages::id.eq(id.as_str()))
                .first::<MessageRow>(conn)
                .optional()
                .map(|row| row.map(Message::from))
        })
        .await
    }

    /// Messages of one chat in chronological (ascending) order for
    /// display. Internally queries newest-first and reverses, so
    /// limit/offset page backwards from the most recent message.
    pub async fn list_messages(
        &self,
        chat_jid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let jid = chat_jid.to_string();
        self.with_conn("list_messages", move |conn| {
            let mut rows: Vec<MessageRow> = messages::table
                .filter(messages::chat_jid.eq(jid.as_str()))
                .order(messages::timestamp.desc())
                .limit(limit)
                .offset(offset)
                .load(conn)?;
            rows.reverse();
            Ok(rows.into_iter().map(Message::from).collect())
        })
        .await
    }

    /// Chats ordered by most-recent activity, joined with contact
    /// display data. A contact name or picture, where known, wins over
    /// the raw chat fields.
    pub async fn list_chats(&self, limit: i64) -> Result<Vec<ChatSummary>> {
        self.with_conn("list_chats", move |conn| {
            let rows: Vec<(
                String,
                Option<String>,
                Option<String>,
                Option<i64>,
                Option<String>,
                i32,
                bool,
                Option<Vec<u8>>,
                Option<String>,
                Option<String>,
                Option<Vec<u8>>,
            )> = chats::table
                .left_join(contacts::table.on(contacts::jid.eq(chats::jid)))
                .select((
                    chats::jid,
                    chats::name,
                    chats::last_message_text,
                    chats::last_message_ts,
                    chats::last_message_type,
                    chats::unread_count,
                    chats::archived,
                    chats::avatar,
                    contacts::name.nullable(),
                    contacts::phone.nullable(),
                    contacts::avatar.nullable(),
                ))
                .order(chats::last_message_ts.desc())
                .limit(limit)
                .load(conn)?;

            Ok(rows
                .into_iter()
                .map(
                    |(
                        jid,
                        name,
                        preview,
                        ts,
                        last_type,
                        unread,
                        archived,
                        chat_avatar,
                        cname,
                        phone,
                        contact_avatar,
                    )| {
                        // Non-text previews stay null; see the note in
                        // DESIGN.md before changing this.
                        let is_text = last_type.as_deref() == Some("text");
                        let avatar_base64 = contact_avatar
                            .or(chat_avatar)
                            .map(|bytes| BASE64_STANDARD.encode(bytes));
                        ChatSummary {
                            name: cname.or(name),
                            last_message: if is_text { preview } else { None },
                            timestamp: ts,
                            unread_count: unread,
                            phone,
                            avatar_base64,
                            archived,
                            jid,
                        }
                    },
                )
                .collect())
        })
        .await
    }

    pub async fn chat_count(&self) -> Result<i64> {
        self.with_conn("chat_count", |conn| chats::table.count().get_result(conn))
            .await
    }

    pub async fn all_chat_jids(&self) -> Result<Vec<String>> {
        self.with_conn("all_chat_jids", |conn| {
            chats::table.select(chats::jid).load(conn)
        })
        .await
    }

    /// High-water mark for incremental sync.
    pub async fn newest_message_ts(&self, chat_jid: &str) -> Result<Option<i64>> {
        let jid = chat_jid.to_string();
        self.with_conn("newest_message_ts", move |conn| {
            messages::table
                .filter(messages::chat_jid.eq(jid.as_str()))
                .select(diesel::dsl::max(messages::timestamp))
                .get_result(conn)
        })
        .await
    }

    pub async fn increment_unread(&self, chat_jid: &str) -> Result<()> {
        let jid = chat_jid.to_string();
        self.with_conn("increment_unread", move |conn| {
            diesel::update(chats::table.filter(chats::jid.eq(jid.as_str())))
                .set(chats::unread_count.eq(chats::unread_count + 1))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn set_chat_name(&self, chat_jid: &str, name: &str) -> Result<()> {
        let (jid, name) = (chat_jid.to_string(), name.to_string());
        self.with_conn("set_chat_name", move |conn| {
            diesel::update(chats::table.filter(chats::jid.eq(jid.as_str())))
                .set(chats::name.eq(name.as_str()))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn set_chat_avatar(&self, chat_jid: &str, avatar: Vec<u8>) -> Result<()> {
        let jid = chat_jid.to_string();
        self.with_conn("set_chat_avatar", move |conn| {
            diesel::update(chats::table.filter(chats::jid.eq(jid.as_str())))
                .set(chats::avatar.eq(avatar.as_slice()))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn mark_chat_synced(&self, chat_jid: &str, ts: i64, complete: bool) -> Result<()> {
        let jid = chat_jid.to_string();
        self.with_conn("mark_chat_synced", move |conn| {
            diesel::update(chats::table.filter(chats::jid.eq(jid.as_str())))
                .set((
                    chats::last_synced_at.eq(ts),
                    chats::history_complete.eq(complete),
                ))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        let c = contact.clone();
        self.with_conn("upsert_contact", move |conn| {
            let values = (
                contacts::name.eq(c.name.as_deref()),
                contacts::phone.eq(c.phone.as_deref()),
                contacts::avatar.eq(c.avatar.as_deref()),
                contacts::blocked.eq(c.blocked),
            );
            diesel::insert_into(contacts::table)
                .values((contacts::jid.eq(c.jid.as_str()), values))
                .on_conflict(contacts::jid)
                .do_update()
                .set(values)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn get_contact(&self, jid: &str) -> Result<Option<Contact>> {
        let jid = jid.to_string();
        self.with_conn("get_contact", move |conn| {
            contacts::table
                .filter(contacts::jid.eq(jid.as_str()))
                .first::<(String, Option<String>, Option<String>, Option<Vec<u8>>, bool)>(conn)
                .optional()
                .map(|row| {
                    row.map(|(jid, name, phone, avatar, blocked)| Contact {
                        jid,
                        name,
                        phone,
                        avatar,
                        blocked,
                    })
                })
        })
        .await
    }

    pub async fn upsert_media(&self, item: &Media) -> Result<()> {
        let m = item.clone();
        self.with_conn("upsert_media", move |conn| {
            let values = (
                media::file_path.eq(m.file_path.as_deref()),
                media::file_name.eq(m.file_name.as_deref()),
                media::file_size.eq(m.file_size),
                media::mime_type.eq(m.mime_type.as_deref()),
            );
            diesel::insert_into(media::table)
                .values((
                    media::id.eq(m.id.as_str()),
                    media::message_id.eq(m.message_id.as_str()),
                    values,
                ))
                .on_conflict(media::id)
                .do_update()
                .set(values)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn get_media(&self, message_id: &str) -> Result<Option<Media>> {
        let message_id = message_id.to_string();
        self.with_conn("get_media", move |conn| {
            media::table
                .filter(media::message_id.eq(message_id.as_str()))
                .first::<(
                    String,
                    String,
                    Option<String>,
                    Option<String>,
                    Option<i64>,
                    Option<String>,
                )>(conn)
                .optional()
                .map(|row| {
                    row.map(
                        |(id, message_id, file_path, file_name, file_size, mime_type)| Media {
                            id,
                            message_id,
                            file_path,
                            file_name,
                            file_size,
                            mime_type,
                        },
                    )
                })
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn("set_setting", move |conn| {
            diesel::insert_into(settings::table)
                .values((
                    settings::key.eq(key.as_str()),
                    settings::value.eq(value.as_str()),
                ))
                .on_conflict(settings::key)
                .do_update()
                .set(settings::value.eq(value.as_str()))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn("get_setting", move |conn| {
            settings::table
                .filter(settings::key.eq(key.as_str()))
                .select(settings::value)
                .first(conn)
                .optional()
        })
        .await
    }

    /// Drops messages past the retention window, their orphaned media
    /// rows, and reclaims file space. Meant to run from the supervisor's
    /// maintenance job, not from request paths.
    pub async fn cleanup(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - RETENTION_DAYS * 24 * 60 * 60 * 1000;
        self.with_conn("cleanup", move |conn| {
            let deleted =
                diesel::delete(messages::table.filter(messages::timestamp.lt(cutoff)))
                    .execute(conn)?;
            diesel::delete(
                media::table
                    .filter(media::message_id.ne_all(messages::table.select(messages::id))),
            )
            .execute(conn)?;
            sql_query("VACUUM").execute(conn)?;
            Ok(deleted)
        })
        .await
    }
}
