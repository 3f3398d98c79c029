//! SQLite storage layer for SafeLink.
//!
//! Two tables, both keyed by id and holding the full record as JSON:
//!
//! - `messages`: queued envelopes, for crash recovery of the relay queue
//! - `relief_requests`: relief requests and their status
//!
//! `status` and `created_at` are duplicated into columns so they can be
//! filtered and ordered without decoding the body.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::warn;

use crate::alerts::ReliefStore;
use crate::model::{MessageEnvelope, ReliefRequest};
use crate::relay::MessageCache;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:safelink.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = if database_url.contains(":memory:") {
            // Every connection to an in-memory database is a fresh database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relief_requests (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relief_requests_status
            ON relief_requests(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace an envelope.
    pub async fn upsert_message(&self, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        let body = serde_json::to_string(envelope)?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, status, created_at, body)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body
            "#,
        )
        .bind(&envelope.id)
        .bind(envelope.status.as_str())
        .bind(envelope.created_at.timestamp_millis())
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_message(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All stored envelopes, oldest first.
    ///
    /// Rows whose body no longer decodes are skipped with a warning.
    pub async fn load_messages(&self) -> anyhow::Result<Vec<MessageEnvelope>> {
        let rows = sqlx::query("SELECT id, body FROM messages ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            match serde_json::from_str(&row.get::<String, _>("body")) {
                Ok(envelope) => messages.push(envelope),
                Err(e) => {
                    let id: String = row.get("id");
                    warn!(message_id = %id, error = %e, "Skipping undecodable stored message");
                }
            }
        }
        Ok(messages)
    }

    /// Insert a new relief request. Fails if the id already exists.
    pub async fn insert_relief_request(&self, request: &ReliefRequest) -> anyhow::Result<()> {
        let body = serde_json::to_string(request)?;

        sqlx::query(
            r#"
            INSERT INTO relief_requests (id, status, created_at, body)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(request.status.as_str())
        .bind(request.created_at.timestamp_millis())
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite an existing relief request.
    pub async fn update_relief_request(&self, request: &ReliefRequest) -> anyhow::Result<()> {
        let body = serde_json::to_string(request)?;

        let result = sqlx::query(
            r#"
            UPDATE relief_requests SET status = ?, body = ?
            WHERE id = ?
            "#,
        )
        .bind(request.status.as_str())
        .bind(body)
        .bind(&request.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("relief request {} not found", request.id);
        }
        Ok(())
    }

    pub async fn get_relief_request(&self, id: &str) -> anyhow::Result<Option<ReliefRequest>> {
        let row = sqlx::query("SELECT body FROM relief_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(serde_json::from_str(&r.get::<String, _>("body"))?)),
            None => Ok(None),
        }
    }

    /// All relief requests, oldest first.
    pub async fn load_relief_requests(&self) -> anyhow::Result<Vec<ReliefRequest>> {
        let rows = sqlx::query("SELECT body FROM relief_requests ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("body"))?))
            .collect()
    }
}

#[async_trait]
impl MessageCache for Storage {
    async fn save(&self, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        self.upsert_message(envelope).await
    }

    async fn update(&self, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        self.upsert_message(envelope).await
    }

    async fn remove(&self, message_id: &str) -> anyhow::Result<()> {
        self.delete_message(message_id).await
    }

    async fn list_all(&self) -> anyhow::Result<Vec<MessageEnvelope>> {
        self.load_messages().await
    }
}

#[async_trait]
impl ReliefStore for Storage {
    async fn create(&self, request: &ReliefRequest) -> anyhow::Result<()> {
        self.insert_relief_request(request).await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<ReliefRequest>> {
        self.get_relief_request(id).await
    }

    async fn update(&self, request: &ReliefRequest) -> anyhow::Result<()> {
        self.update_relief_request(request).await
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ReliefRequest>> {
        self.load_relief_requests().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageMeta, MessageStatus, Priority, ReliefStatus};
    use chrono::Utc;

    fn envelope(id: &str) -> MessageEnvelope {
        MessageEnvelope {
            id: id.to_string(),
            sender_id: "me".to_string(),
            receiver_id: Some("A".to_string()),
            sealed_payload: vec![1, 2, 3],
            signature: vec![9; 32],
            created_at: Utc::now(),
            status: MessageStatus::Pending,
            hop_count: 0,
            retry_count: 0,
            meta: MessageMeta::with_priority(Priority::High).with_extra("category", "medical"),
        }
    }

    fn relief(id: &str) -> ReliefRequest {
        let now = Utc::now();
        ReliefRequest {
            id: id.to_string(),
            requester_id: "ngo".to_string(),
            kind: "shelter".to_string(),
            title: "Tents".to_string(),
            description: String::new(),
            items: Vec::new(),
            amount_needed: None,
            currency: "USD".to_string(),
            location: None,
            priority: Priority::High,
            status: ReliefStatus::Open,
            created_at: now,
            updated_at: now,
            linked_alert_id: None,
        }
    }

    #[tokio::test]
    async fn test_message_save_update_remove() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut msg = envelope("m1");
        MessageCache::save(&storage, &msg).await.unwrap();

        msg.status = MessageStatus::Delivered;
        msg.hop_count = 1;
        MessageCache::update(&storage, &msg).await.unwrap();

        let stored = MessageCache::list_all(&storage).await.unwrap();
        assert_eq!(stored, vec![msg]);

        MessageCache::remove(&storage, "m1").await.unwrap();
        assert!(MessageCache::list_all(&storage).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_messages_load_oldest_first() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut newer = envelope("newer");
        newer.created_at = Utc::now();
        let mut older = envelope("older");
        older.created_at = newer.created_at - chrono::Duration::minutes(5);

        storage.upsert_message(&newer).await.unwrap();
        storage.upsert_message(&older).await.unwrap();

        let ids: Vec<String> = storage
            .load_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["older", "newer"]);
    }

    #[tokio::test]
    async fn test_undecodable_message_rows_are_skipped() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.upsert_message(&envelope("good")).await.unwrap();

        sqlx::query("INSERT INTO messages (id, status, created_at, body) VALUES (?, ?, ?, ?)")
            .bind("bad")
            .bind("pending")
            .bind(Utc::now().timestamp_millis())
            .bind(r#"{"id":"bad","meta":{"priority":"low","priority":"high"}}"#)
            .execute(&storage.pool)
            .await
            .unwrap();

        let loaded = MessageCache::list_all(&storage).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "good");
    }

    #[tokio::test]
    async fn test_relief_round_trip() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut request = relief("r1");
        ReliefStore::create(&storage, &request).await.unwrap();
        assert!(ReliefStore::create(&storage, &request).await.is_err());

        request.status = ReliefStatus::Partial;
        request.linked_alert_id = Some("relief-1".to_string());
        ReliefStore::update(&storage, &request).await.unwrap();

        let stored = ReliefStore::get(&storage, "r1").await.unwrap().unwrap();
        assert_eq!(stored, request);
        assert!(ReliefStore::get(&storage, "r2").await.unwrap().is_none());
        assert_eq!(ReliefStore::list_all(&storage).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_relief_fails() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        assert!(storage.update_relief_request(&relief("ghost")).await.is_err());
    }
}
