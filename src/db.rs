use crate::error::StoreError;
use crate::types::{CanonicalAddress, MessageKind};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    None,
    Pending,
    Stabilized,
    Failed,
}

impl MediaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Stabilized => "stabilized",
            Self::Failed => "failed",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "stabilized" => Self::Stabilized,
            "failed" => Self::Failed,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub instance: String,
    pub canonical_address: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_group: bool,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub instance: String,
    pub canonical_address: CanonicalAddress,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub instance: String,
    pub external_id: String,
    pub from_me: bool,
    pub kind: MessageKind,
    pub sender_address: Option<String>,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub media_key: Option<String>,
    pub media_direct_path: Option<String>,
    pub media_state: MediaState,
    pub media_attempts: i64,
    pub media_error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn preview(&self) -> String {
        preview_text(self.kind, self.content.as_deref())
    }
}

pub fn preview_text(kind: MessageKind, content: Option<&str>) -> String {
    match content {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => kind.placeholder().to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub instance: String,
    pub external_id: String,
    pub from_me: bool,
    pub kind: MessageKind,
    pub sender_address: Option<String>,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub media_key: Option<String>,
    pub media_direct_path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    fn has_media(&self) -> bool {
        self.media_url.is_some() || self.media_direct_path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageInsert {
    Inserted(MessageRecord),
    /// A message with the same (instance, external id) already existed.
    Duplicate(MessageRecord),
}

impl MessageInsert {
    pub fn record(&self) -> &MessageRecord {
        match self {
            Self::Inserted(record) | Self::Duplicate(record) => record,
        }
    }

    pub fn into_record(self) -> MessageRecord {
        match self {
            Self::Inserted(record) | Self::Duplicate(record) => record,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub instance: String,
    pub alias: String,
    pub stable: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub conversations: i64,
    pub messages: i64,
    pub pending_media: i64,
}

/// Everything the ingestion pipeline needs from the relational store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_conversation(
        &self,
        instance: &str,
        address: &CanonicalAddress,
    ) -> StoreResult<Option<ConversationRecord>>;

    /// Inserts unless the (instance, address) key exists, then rereads.
    async fn create_conversation(&self, new: &NewConversation) -> StoreResult<ConversationRecord>;

    /// Moves the preview forward only when `at` is not older than the stored one.
    async fn update_conversation_preview(
        &self,
        id: &str,
        preview: &str,
        at: DateTime<Utc>,
        unread_delta: i64,
    ) -> StoreResult<()>;

    async fn update_conversation_profile(
        &self,
        id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> StoreResult<()>;

    async fn rekey_conversation(
        &self,
        id: &str,
        address: &CanonicalAddress,
    ) -> StoreResult<ConversationRecord>;

    /// Re-owns every message of `loser_id` to `winner_id` and deletes the loser, atomically.
    async fn merge_conversations(
        &self,
        loser_id: &str,
        winner_id: &str,
    ) -> StoreResult<ConversationRecord>;

    async fn create_message(&self, new: &NewMessage) -> StoreResult<MessageInsert>;

    /// Inserts the message and, only if it was new, moves the conversation preview and
    /// adds `unread_delta`, in one transaction.
    async fn record_message(&self, new: &NewMessage, unread_delta: i64) -> StoreResult<MessageInsert>;

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>>;

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<MessageRecord>>;

    async fn update_message_media(&self, id: &str, url: &str) -> StoreResult<()>;

    async fn record_media_failure(&self, id: &str, attempts: i64, error: &str) -> StoreResult<()>;

    /// Pending or failed media older than `created_before` with fewer than `max_attempts` tries.
    async fn list_unstabilized_media(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageRecord>>;

    async fn find_alias(&self, instance: &str, alias: &str) -> StoreResult<Option<String>>;

    /// Returns true when the mapping is new or changed.
    async fn upsert_alias(&self, instance: &str, alias: &str, stable: &str) -> StoreResult<bool>;

    async fn list_aliases(&self, instance: &str) -> StoreResult<Vec<AliasRecord>>;

    async fn counts(&self) -> StoreResult<StoreCounts>;
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

const CONVERSATION_COLUMNS: &str = "id, instance, canonical_address, display_name, avatar_url, is_group, last_message, last_message_at, unread_count, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, instance, external_id, from_me, kind, sender_address, content, media_url, media_mime, media_key, media_direct_path, media_state, media_attempts, media_error, timestamp, created_at";

fn conversation_from_row(row: &AnyRow) -> StoreResult<ConversationRecord> {
    let last_message_at: Option<i64> = row.try_get("last_message_at")?;
    let is_group: i64 = row.try_get("is_group")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        instance: row.try_get("instance")?,
        canonical_address: row.try_get("canonical_address")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        is_group: is_group != 0,
        last_message: row.try_get("last_message")?,
        last_message_at: last_message_at.map(i64_to_datetime),
        unread_count: row.try_get("unread_count")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn message_from_row(row: &AnyRow) -> StoreResult<MessageRecord> {
    let from_me: i64 = row.try_get("from_me")?;
    let kind: String = row.try_get("kind")?;
    let media_state: String = row.try_get("media_state")?;
    let timestamp: i64 = row.try_get("timestamp")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        instance: row.try_get("instance")?,
        external_id: row.try_get("external_id")?,
        from_me: from_me != 0,
        kind: MessageKind::from_str_lossy(&kind),
        sender_address: row.try_get("sender_address")?,
        content: row.try_get("content")?,
        media_url: row.try_get("media_url")?,
        media_mime: row.try_get("media_mime")?,
        media_key: row.try_get("media_key")?,
        media_direct_path: row.try_get("media_direct_path")?,
        media_state: MediaState::from_db(&media_state),
        media_attempts: row.try_get("media_attempts")?,
        media_error: row.try_get("media_error")?,
        timestamp: i64_to_datetime(timestamp),
        created_at: i64_to_datetime(created_at),
    })
}

/// Opens a pool and creates the schema. In-memory SQLite is pinned to one connection
/// so every query sees the same database.
pub async fn connect(url: &str) -> StoreResult<SqlStore> {
    sqlx::any::install_default_drivers();
    let kind = db_kind_from_url(url);
    let pool = if url.contains(":memory:") {
        AnyPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?
    } else {
        AnyPoolOptions::new().max_connections(8).connect(url).await?
    };
    init_db(&pool, kind).await?;
    Ok(SqlStore::new(pool, kind))
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> StoreResult<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            instance TEXT NOT NULL,
            canonical_address TEXT NOT NULL,
            display_name TEXT,
            avatar_url TEXT,
            is_group BIGINT NOT NULL,
            last_message TEXT,
            last_message_at BIGINT,
            unread_count BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            UNIQUE (instance, canonical_address)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            instance TEXT NOT NULL,
            external_id TEXT NOT NULL,
            from_me BIGINT NOT NULL,
            kind TEXT NOT NULL,
            sender_address TEXT,
            content TEXT,
            media_url TEXT,
            media_mime TEXT,
            media_key TEXT,
            media_direct_path TEXT,
            media_state TEXT NOT NULL,
            media_attempts BIGINT NOT NULL,
            media_error TEXT,
            timestamp BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            UNIQUE (instance, external_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_media_state ON messages(media_state)"#,
        r#"CREATE TABLE IF NOT EXISTS address_aliases (
            instance TEXT NOT NULL,
            alias TEXT NOT NULL,
            stable TEXT NOT NULL,
            updated_at BIGINT NOT NULL,
            PRIMARY KEY (instance, alias)
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlStore {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn sql<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        rewrite_sql(sql, self.kind)
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<ConversationRecord>> {
        let base = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?");
        let sql = self.sql(&base);
        let row = sqlx::query(sql.as_ref())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    fn new_message_record(new: &NewMessage) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: new.conversation_id.clone(),
            instance: new.instance.clone(),
            external_id: new.external_id.clone(),
            from_me: new.from_me,
            kind: new.kind,
            sender_address: new.sender_address.clone(),
            content: new.content.clone(),
            media_url: new.media_url.clone(),
            media_mime: new.media_mime.clone(),
            media_key: new.media_key.clone(),
            media_direct_path: new.media_direct_path.clone(),
            media_state: if new.has_media() {
                MediaState::Pending
            } else {
                MediaState::None
            },
            media_attempts: 0,
            media_error: None,
            timestamp: new.timestamp,
            created_at: Utc::now(),
        }
    }

    /// Returns false when the (instance, external id) key already exists.
    async fn insert_message(&self, conn: &mut AnyConnection, record: &MessageRecord) -> StoreResult<bool> {
        let sql = self.sql(
            r#"INSERT INTO messages (
                id, conversation_id, instance, external_id, from_me, kind, sender_address, content,
                media_url, media_mime, media_key, media_direct_path, media_state, media_attempts,
                media_error, timestamp, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            ON CONFLICT (instance, external_id) DO NOTHING"#,
        );
        let result = sqlx::query(sql.as_ref())
            .bind(&record.id)
            .bind(&record.conversation_id)
            .bind(&record.instance)
            .bind(&record.external_id)
            .bind(i64::from(record.from_me))
            .bind(record.kind.as_str())
            .bind(record.sender_address.as_deref())
            .bind(record.content.as_deref())
            .bind(record.media_url.as_deref())
            .bind(record.media_mime.as_deref())
            .bind(record.media_key.as_deref())
            .bind(record.media_direct_path.as_deref())
            .bind(record.media_state.as_str())
            .bind(datetime_to_i64(record.timestamp))
            .bind(datetime_to_i64(record.created_at))
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn bump_preview(
        &self,
        conn: &mut AnyConnection,
        id: &str,
        preview: &str,
        at: DateTime<Utc>,
        unread_delta: i64,
    ) -> StoreResult<()> {
        let at = datetime_to_i64(at);
        let sql = self.sql(
            r#"UPDATE conversations SET
                last_message = CASE WHEN last_message_at IS NULL OR last_message_at <= ? THEN ? ELSE last_message END,
                last_message_at = CASE WHEN last_message_at IS NULL OR last_message_at <= ? THEN ? ELSE last_message_at END,
                unread_count = unread_count + ?,
                updated_at = ?
            WHERE id = ?"#,
        );
        let result = sqlx::query(sql.as_ref())
            .bind(at)
            .bind(preview)
            .bind(at)
            .bind(at)
            .bind(unread_delta)
            .bind(datetime_to_i64(Utc::now()))
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("conversation {id} no longer exists")));
        }
        Ok(())
    }

    async fn existing_message(&self, new: &NewMessage) -> StoreResult<MessageInsert> {
        self.find_message_by_external_id(&new.instance, &new.external_id)
            .await?
            .map(MessageInsert::Duplicate)
            .ok_or_else(|| StoreError::Conflict(format!("message {} vanished after insert", new.external_id)))
    }

    async fn find_message_by_external_id(
        &self,
        instance: &str,
        external_id: &str,
    ) -> StoreResult<Option<MessageRecord>> {
        let base = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE instance = ? AND external_id = ?");
        let sql = self.sql(&base);
        let row = sqlx::query(sql.as_ref())
            .bind(instance)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }
}

#[async_trait]
impl ConversationStore for SqlStore {
    async fn find_conversation(
        &self,
        instance: &str,
        address: &CanonicalAddress,
    ) -> StoreResult<Option<ConversationRecord>> {
        let base = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE instance = ? AND canonical_address = ?"
        );
        let sql = self.sql(&base);
        let row = sqlx::query(sql.as_ref())
            .bind(instance)
            .bind(address.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn create_conversation(&self, new: &NewConversation) -> StoreResult<ConversationRecord> {
        let now = datetime_to_i64(Utc::now());
        let sql = self.sql(
            r#"INSERT INTO conversations (
                id, instance, canonical_address, display_name, avatar_url, is_group,
                last_message, last_message_at, unread_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, NULL, ?, NULL, NULL, 0, ?, ?)
            ON CONFLICT (instance, canonical_address) DO NOTHING"#,
        );
        sqlx::query(sql.as_ref())
            .bind(Uuid::new_v4().to_string())
            .bind(&new.instance)
            .bind(new.canonical_address.as_str())
            .bind(new.display_name.as_deref())
            .bind(i64::from(new.canonical_address.is_group()))
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        self.find_conversation(&new.instance, &new.canonical_address)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "conversation {} vanished after insert",
                    new.canonical_address
                ))
            })
    }

    async fn update_conversation_preview(
        &self,
        id: &str,
        preview: &str,
        at: DateTime<Utc>,
        unread_delta: i64,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.bump_preview(&mut conn, id, preview, at, unread_delta).await
    }

    async fn update_conversation_profile(
        &self,
        id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> StoreResult<()> {
        let sql = self.sql(
            r#"UPDATE conversations SET
                display_name = COALESCE(?, display_name),
                avatar_url = COALESCE(?, avatar_url),
                updated_at = ?
            WHERE id = ?"#,
        );
        sqlx::query(sql.as_ref())
            .bind(display_name)
            .bind(avatar_url)
            .bind(datetime_to_i64(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rekey_conversation(
        &self,
        id: &str,
        address: &CanonicalAddress,
    ) -> StoreResult<ConversationRecord> {
        let sql = self.sql(
            "UPDATE conversations SET canonical_address = ?, is_group = ?, updated_at = ? WHERE id = ?",
        );
        let result = sqlx::query(sql.as_ref())
            .bind(address.as_str())
            .bind(i64::from(address.is_group()))
            .bind(datetime_to_i64(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                    format!("conversation for {address} already exists"),
                ),
                _ => StoreError::Database(err),
            })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("conversation {id}")));
        }
        self.get_conversation(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))
    }

    async fn merge_conversations(
        &self,
        loser_id: &str,
        winner_id: &str,
    ) -> StoreResult<ConversationRecord> {
        if loser_id == winner_id {
            return Err(StoreError::Conflict("cannot merge a conversation into itself".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let loser_sql = self.sql("SELECT display_name, unread_count FROM conversations WHERE id = ?");
        let loser = sqlx::query(loser_sql.as_ref())
            .bind(loser_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {loser_id}")))?;
        let loser_name: Option<String> = loser.try_get("display_name")?;
        let loser_unread: i64 = loser.try_get("unread_count")?;

        let move_sql = self.sql("UPDATE messages SET conversation_id = ? WHERE conversation_id = ?");
        sqlx::query(move_sql.as_ref())
            .bind(winner_id)
            .bind(loser_id)
            .execute(&mut *tx)
            .await?;

        let delete_sql = self.sql("DELETE FROM conversations WHERE id = ?");
        sqlx::query(delete_sql.as_ref())
            .bind(loser_id)
            .execute(&mut *tx)
            .await?;

        let latest_sql = self.sql(
            "SELECT kind, content, timestamp FROM messages WHERE conversation_id = ? ORDER BY timestamp DESC, created_at DESC LIMIT 1",
        );
        let latest = sqlx::query(latest_sql.as_ref())
            .bind(winner_id)
            .fetch_optional(&mut *tx)
            .await?;
        let (preview, preview_at) = match latest {
            Some(row) => {
                let kind: String = row.try_get("kind")?;
                let content: Option<String> = row.try_get("content")?;
                let ts: i64 = row.try_get("timestamp")?;
                (
                    Some(preview_text(MessageKind::from_str_lossy(&kind), content.as_deref())),
                    Some(ts),
                )
            }
            None => (None, None),
        };

        let winner_sql = self.sql(
            r#"UPDATE conversations SET
                last_message = ?,
                last_message_at = ?,
                unread_count = unread_count + ?,
                display_name = COALESCE(display_name, ?),
                updated_at = ?
            WHERE id = ?"#,
        );
        let updated = sqlx::query(winner_sql.as_ref())
            .bind(preview)
            .bind(preview_at)
            .bind(loser_unread)
            .bind(loser_name)
            .bind(datetime_to_i64(Utc::now()))
            .bind(winner_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            // Dropping `tx` rolls back the message move and the delete.
            return Err(StoreError::NotFound(format!("conversation {winner_id}")));
        }

        tx.commit().await?;

        self.get_conversation(winner_id)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("conversation {winner_id} vanished after merge")))
    }

    async fn create_message(&self, new: &NewMessage) -> StoreResult<MessageInsert> {
        let record = Self::new_message_record(new);
        let mut conn = self.pool.acquire().await?;
        if self.insert_message(&mut conn, &record).await? {
            return Ok(MessageInsert::Inserted(record));
        }
        drop(conn);
        self.existing_message(new).await
    }

    async fn record_message(&self, new: &NewMessage, unread_delta: i64) -> StoreResult<MessageInsert> {
        let record = Self::new_message_record(new);
        let mut tx = self.pool.begin().await?;
        if !self.insert_message(&mut tx, &record).await? {
            drop(tx);
            return self.existing_message(new).await;
        }
        // An error here drops `tx`, which rolls the insert back with it.
        self.bump_preview(
            &mut tx,
            &record.conversation_id,
            &record.preview(),
            record.timestamp,
            unread_delta,
        )
        .await?;
        tx.commit().await?;
        Ok(MessageInsert::Inserted(record))
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        let base = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
        let sql = self.sql(&base);
        let row = sqlx::query(sql.as_ref())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let base = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY timestamp DESC, created_at DESC"
        );
        let sql = self.sql(&base);
        let rows = sqlx::query(sql.as_ref())
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn update_message_media(&self, id: &str, url: &str) -> StoreResult<()> {
        let sql = self.sql(
            "UPDATE messages SET media_url = ?, media_state = 'stabilized', media_error = NULL WHERE id = ?",
        );
        let result = sqlx::query(sql.as_ref())
            .bind(url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn record_media_failure(&self, id: &str, attempts: i64, error: &str) -> StoreResult<()> {
        let sql = self.sql(
            "UPDATE messages SET media_state = 'failed', media_attempts = media_attempts + ?, media_error = ? WHERE id = ? AND media_state <> 'stabilized'",
        );
        sqlx::query(sql.as_ref())
            .bind(attempts)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_unstabilized_media(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageRecord>> {
        let base = format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE media_state IN ('pending', 'failed') AND created_at <= ? AND media_attempts < ?
            ORDER BY media_attempts ASC, timestamp ASC LIMIT ?"#
        );
        let sql = self.sql(&base);
        let rows = sqlx::query(sql.as_ref())
            .bind(datetime_to_i64(created_before))
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn find_alias(&self, instance: &str, alias: &str) -> StoreResult<Option<String>> {
        let sql = self.sql("SELECT stable FROM address_aliases WHERE instance = ? AND alias = ?");
        let row = sqlx::query(sql.as_ref())
            .bind(instance)
            .bind(alias)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("stable")?),
            None => None,
        })
    }

    async fn upsert_alias(&self, instance: &str, alias: &str, stable: &str) -> StoreResult<bool> {
        if self.find_alias(instance, alias).await?.as_deref() == Some(stable) {
            return Ok(false);
        }
        let sql = self.sql(
            r#"INSERT INTO address_aliases (instance, alias, stable, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (instance, alias) DO UPDATE SET
                stable = excluded.stable,
                updated_at = excluded.updated_at"#,
        );
        sqlx::query(sql.as_ref())
            .bind(instance)
            .bind(alias)
            .bind(stable)
            .bind(datetime_to_i64(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn list_aliases(&self, instance: &str) -> StoreResult<Vec<AliasRecord>> {
        let sql = self.sql("SELECT instance, alias, stable FROM address_aliases WHERE instance = ? ORDER BY alias");
        let rows = sqlx::query(sql.as_ref())
            .bind(instance)
            .fetch_all(&self.pool)
            .await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(AliasRecord {
                instance: row.try_get("instance")?,
                alias: row.try_get("alias")?,
                stable: row.try_get("stable")?,
            });
        }
        Ok(result)
    }

    async fn counts(&self) -> StoreResult<StoreCounts> {
        let conversations = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        let messages = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let pending_media = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM messages WHERE media_state IN ('pending', 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            conversations,
            messages,
            pending_media,
        })
    }
}
