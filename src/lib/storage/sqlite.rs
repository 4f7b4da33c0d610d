use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::Mutex;

use crate::core::{
    ChannelInfo, Cursor, FetchOutcome, Message, MessageId, PublishRequest, RetentionPolicy,
    TraversalOrder,
};
use crate::storage::Storage;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS messages (
        channel TEXT NOT NULL,
        ts INTEGER NOT NULL,
        tag INTEGER NOT NULL,
        payload BLOB NOT NULL,
        content_type TEXT NOT NULL,
        ttl_ms INTEGER,
        created_at_ms INTEGER NOT NULL,
        expires_at_ms INTEGER,
        PRIMARY KEY (channel, ts, tag)
    )",
    "CREATE INDEX IF NOT EXISTS messages_expiry ON messages (expires_at_ms)",
    "CREATE TABLE IF NOT EXISTS channels (
        channel TEXT PRIMARY KEY,
        last_ts INTEGER NOT NULL,
        last_tag INTEGER NOT NULL,
        last_published_ms INTEGER NOT NULL
    )",
];

const COLUMNS: &str = "channel, ts, tag, payload, content_type, ttl_ms, created_at_ms";
const LIVE: &str = "(expires_at_ms IS NULL OR expires_at_ms > ?)";

/// Channel logs persisted in SQLite.
///
/// Writers are serialized by `write_lock`; SQLite allows one writer at a
/// time anyway. Reads filter out expired rows, and [`Storage::evict_expired`]
/// deletes them.
pub struct SqliteStorage {
    pool: SqlitePool,
    policy: RetentionPolicy,
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &str, policy: RetentionPolicy) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool, policy).await
    }

    /// A private in-memory database, gone when the storage is dropped.
    pub async fn in_memory(policy: RetentionPolicy) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, policy).await
    }

    pub async fn with_pool(pool: SqlitePool, policy: RetentionPolicy) -> anyhow::Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            policy,
            write_lock: Mutex::new(()),
        })
    }

    async fn next_tag(
        tx: &mut Transaction<'_, Sqlite>,
        channel: &str,
        ts: i64,
        last: Option<MessageId>,
    ) -> anyhow::Result<u32> {
        let issued = last.filter(|last| last.timestamp == ts).map(|last| last.tag);
        let retained: Option<i64> =
            sqlx::query_scalar("SELECT MAX(tag) FROM messages WHERE channel = ? AND ts = ?")
                .bind(channel)
                .bind(ts)
                .fetch_one(&mut **tx)
                .await?;
        let retained = retained.map(u32::try_from).transpose()?;
        Ok(match issued.max(retained) {
            Some(tag) => tag.saturating_add(1),
            None => 0,
        })
    }

    async fn count(&self, channel: &str, now_ms: i64) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM messages WHERE channel = ? AND {LIVE}"
        ))
        .bind(channel)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count)?)
    }

    async fn first_after(
        &self,
        channel: &str,
        after: Option<MessageId>,
        now_ms: i64,
    ) -> anyhow::Result<Option<Message>> {
        let row = match after {
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM messages WHERE channel = ? AND {LIVE}
                     ORDER BY ts, tag LIMIT 1"
                ))
                .bind(channel)
                .bind(now_ms)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM messages WHERE channel = ? AND {LIVE}
                     AND (ts > ? OR (ts = ? AND tag > ?)) ORDER BY ts, tag LIMIT 1"
                ))
                .bind(channel)
                .bind(now_ms)
                .bind(id.timestamp)
                .bind(id.timestamp)
                .bind(i64::from(id.tag))
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(message_from_row).transpose()
    }

    async fn newest_id(&self, channel: &str, now_ms: i64) -> anyhow::Result<Option<MessageId>> {
        let row = sqlx::query(&format!(
            "SELECT ts, tag FROM messages WHERE channel = ? AND {LIVE}
             ORDER BY ts DESC, tag DESC LIMIT 1"
        ))
        .bind(channel)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(id_from_row).transpose()
    }

    async fn is_retained(&self, channel: &str, id: MessageId, now_ms: i64) -> anyhow::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM messages WHERE channel = ? AND ts = ? AND tag = ? AND {LIVE}"
        ))
        .bind(channel)
        .bind(id.timestamp)
        .bind(i64::from(id.tag))
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

fn id_from_row(row: &SqliteRow) -> anyhow::Result<MessageId> {
    let ts: i64 = row.try_get("ts")?;
    let tag: i64 = row.try_get("tag")?;
    Ok(MessageId::new(ts, u32::try_from(tag)?))
}

fn message_from_row(row: &SqliteRow) -> anyhow::Result<Message> {
    let ttl_ms: Option<i64> = row.try_get("ttl_ms")?;
    let created_at_ms: i64 = row.try_get("created_at_ms")?;
    let payload: Vec<u8> = row.try_get("payload")?;
    Ok(Message {
        id: id_from_row(row)?,
        channel: row.try_get("channel")?,
        payload: Bytes::from(payload),
        content_type: row.try_get("content_type")?,
        ttl: ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        created_at: DateTime::from_timestamp_millis(created_at_ms)
            .ok_or_else(|| anyhow::anyhow!("created_at out of range: {created_at_ms}"))?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn append(&self, request: PublishRequest) -> anyhow::Result<(Message, ChannelInfo)> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let channel = request.channel.clone();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE channel = ? AND expires_at_ms <= ?")
            .bind(&channel)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

        let last =
            sqlx::query("SELECT last_ts AS ts, last_tag AS tag FROM channels WHERE channel = ?")
                .bind(&channel)
                .fetch_optional(&mut *tx)
                .await?
                .as_ref()
                .map(id_from_row)
                .transpose()?;

        let ts = match request.timestamp {
            Some(ts) => ts,
            None => match last {
                Some(last) if last.timestamp > now.timestamp() => last.timestamp,
                _ => now.timestamp(),
            },
        };
        let id = MessageId::new(ts, Self::next_tag(&mut tx, &channel, ts, last).await?);
        let ttl = request
            .effective_ttl()
            .or(self.policy.default_ttl.filter(|ttl| !ttl.is_zero()));
        let ttl_ms = ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        sqlx::query(
            "INSERT INTO messages
                (channel, ts, tag, payload, content_type, ttl_ms, created_at_ms, expires_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&channel)
        .bind(id.timestamp)
        .bind(i64::from(id.tag))
        .bind(request.payload.as_ref())
        .bind(&request.content_type)
        .bind(ttl_ms)
        .bind(now_ms)
        .bind(ttl_ms.map(|ttl| now_ms.saturating_add(ttl)))
        .execute(&mut *tx)
        .await?;

        let newest = match last {
            Some(last) if last > id => last,
            _ => id,
        };
        sqlx::query(
            "INSERT INTO channels (channel, last_ts, last_tag, last_published_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(channel) DO UPDATE SET
                last_ts = excluded.last_ts,
                last_tag = excluded.last_tag,
                last_published_ms = excluded.last_published_ms",
        )
        .bind(&channel)
        .bind(newest.timestamp)
        .bind(i64::from(newest.tag))
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        if let Some(max) = self.policy.max_messages {
            sqlx::query(
                "DELETE FROM messages WHERE rowid IN (
                    SELECT rowid FROM messages WHERE channel = ?
                    ORDER BY ts DESC, tag DESC LIMIT -1 OFFSET ?
                )",
            )
            .bind(&channel)
            .bind(i64::try_from(max)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let message = Message {
            id,
            channel: channel.clone(),
            payload: request.payload,
            content_type: request.content_type,
            ttl,
            created_at: now,
        };
        let info = ChannelInfo {
            messages: self.count(&channel, now_ms).await?,
            last_id: Some(newest),
            last_published_at: Some(now.timestamp()),
            subscribers: 0,
        };
        Ok((message, info))
    }

    async fn query(
        &self,
        channel: &str,
        cursor: Cursor,
        order: TraversalOrder,
    ) -> anyhow::Result<FetchOutcome> {
        let now_ms = Utc::now().timestamp_millis();
        let Some(newest) = self.newest_id(channel, now_ms).await? else {
            return Ok(FetchOutcome::NotFound);
        };
        let after = match cursor {
            Cursor::Start => None,
            Cursor::End => return Ok(FetchOutcome::NotReady),
            Cursor::At(id) => {
                if order == TraversalOrder::Filo
                    && id < newest
                    && !self.is_retained(channel, id, now_ms).await?
                {
                    return Ok(FetchOutcome::NotFound);
                }
                Some(id)
            }
        };
        Ok(match self.first_after(channel, after, now_ms).await? {
            Some(message) => FetchOutcome::Delivered(message),
            None => FetchOutcome::NotReady,
        })
    }

    async fn purge(&self, channel: &str) -> anyhow::Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let removed: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM messages WHERE channel = ? AND {LIVE}"
        ))
        .bind(channel)
        .bind(now_ms)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM messages WHERE channel = ?")
            .bind(channel)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM channels WHERE channel = ?")
            .bind(channel)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(usize::try_from(removed)?)
    }

    async fn channel_info(&self, channel: &str) -> anyhow::Result<Option<ChannelInfo>> {
        let row = sqlx::query(
            "SELECT last_ts AS ts, last_tag AS tag, last_published_ms
             FROM channels WHERE channel = ?",
        )
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let last_published_ms: i64 = row.try_get("last_published_ms")?;
        Ok(Some(ChannelInfo {
            messages: self.count(channel, Utc::now().timestamp_millis()).await?,
            last_id: Some(id_from_row(&row)?),
            last_published_at: Some(last_published_ms.div_euclid(1000)),
            subscribers: 0,
        }))
    }

    async fn snapshot(&self, channel: &str, order: TraversalOrder) -> anyhow::Result<Vec<Message>> {
        let direction = match order {
            TraversalOrder::Fifo => "ASC",
            TraversalOrder::Filo => "DESC",
        };
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM messages WHERE channel = ? AND {LIVE}
             ORDER BY ts {direction}, tag {direction}"
        ))
        .bind(channel)
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn evict_expired(&self) -> anyhow::Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let evicted = sqlx::query("DELETE FROM messages WHERE expires_at_ms <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "DELETE FROM channels WHERE channel NOT IN (SELECT DISTINCT channel FROM messages)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(usize::try_from(evicted)?)
    }
}
