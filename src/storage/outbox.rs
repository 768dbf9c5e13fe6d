//! # Transactional Outbox Queue
//!
//! Decouples a secret-store write from downstream consumers. A message is
//! appended inside the same transaction as the metadata write that triggered
//! it, so it becomes visible to `receive_n` only once that transaction
//! commits, and it stays visible until a consumer deletes it after successful
//! processing: at-least-once delivery, never exactly-once. Consumers must be
//! idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite};
use std::fmt;
use std::str::FromStr;
use tracing::instrument;

use crate::errors::{KeepsakeError, Result};
use crate::storage::DbPool;

/// Kind of secure-value change a message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxMessageType {
    SecureValueCreate,
    SecureValueUpdate,
    SecureValueDelete,
}

impl OutboxMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecureValueCreate => "secure_value_create",
            Self::SecureValueUpdate => "secure_value_update",
            Self::SecureValueDelete => "secure_value_delete",
        }
    }
}

impl FromStr for OutboxMessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "secure_value_create" => Ok(Self::SecureValueCreate),
            "secure_value_update" => Ok(Self::SecureValueUpdate),
            "secure_value_delete" => Ok(Self::SecureValueDelete),
            _ => Err(format!("Unknown outbox message type: {}", s)),
        }
    }
}

impl fmt::Display for OutboxMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message to append, before the queue assigns it an id.
#[derive(Debug, Clone)]
pub struct AppendOutboxMessage {
    pub message_type: OutboxMessageType,
    pub namespace: String,
    pub name: String,
    pub payload: serde_json::Value,
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: i64,
    pub message_type: OutboxMessageType,
    pub namespace: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    message_type: String,
    namespace: String,
    name: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl OutboxRow {
    fn into_message(self) -> Result<OutboxMessage> {
        let message_type = self.message_type.parse::<OutboxMessageType>().map_err(|e| {
            KeepsakeError::internal(format!("Corrupt outbox row {}: {}", self.id, e))
        })?;
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).map_err(|e| KeepsakeError::Serialization {
                source: e,
                context: format!("Failed to decode outbox payload for message {}", self.id),
            })?;

        Ok(OutboxMessage {
            id: self.id,
            message_type,
            namespace: self.namespace,
            name: self.name,
            payload,
            created_at: self.created_at,
        })
    }
}

/// Transactional message queue over the `secret_outbox` table.
#[derive(Clone)]
pub struct OutboxQueue {
    pool: DbPool,
}

impl std::fmt::Debug for OutboxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxQueue").field("pool", &"[DbPool]").finish()
    }
}

impl OutboxQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append a message using the caller's executor. Pass the transaction
    /// performing the triggering metadata write so both commit atomically;
    /// the message is invisible to `receive_n` until then.
    #[instrument(skip(self, executor, message), fields(message_type = %message.message_type, name = %message.name), name = "db_outbox_append")]
    pub async fn append<'e, E>(&self, executor: E, message: AppendOutboxMessage) -> Result<i64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let payload = serde_json::to_string(&message.payload).map_err(|e| {
            KeepsakeError::Serialization {
                source: e,
                context: format!("Failed to encode outbox payload for '{}'", message.name),
            }
        })?;

        let result = sqlx::query(
            "INSERT INTO secret_outbox (message_type, namespace, name, payload, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.message_type.as_str())
        .bind(&message.namespace)
        .bind(&message.name)
        .bind(&payload)
        .bind(Utc::now())
        .execute(executor)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to append outbox message for '{}'", message.name),
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Fetch up to `n` committed, undeleted messages in insertion order. A
    /// message stays visible to later calls until it is deleted, so a
    /// consumer that crashes mid-processing sees it again.
    #[instrument(skip(self), name = "db_outbox_receive_n")]
    pub async fn receive_n(&self, n: u32) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query_as::<Sqlite, OutboxRow>(
            "SELECT id, message_type, namespace, name, payload, created_at \
             FROM secret_outbox ORDER BY id ASC LIMIT ?",
        )
        .bind(i64::from(n))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: "Failed to receive outbox messages".to_string(),
        })?;

        rows.into_iter().map(OutboxRow::into_message).collect()
    }

    /// Remove a message after successful consumption. Deleting an unknown id
    /// fails NotFound so a consumer can tell a double-delete from a success.
    #[instrument(skip(self), fields(message_id = message_id), name = "db_outbox_delete")]
    pub async fn delete(&self, message_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM secret_outbox WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: format!("Failed to delete outbox message {}", message_id),
            })?;

        if result.rows_affected() == 0 {
            return Err(KeepsakeError::not_found("outbox_message", message_id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    fn message(name: &str) -> AppendOutboxMessage {
        AppendOutboxMessage {
            message_type: OutboxMessageType::SecureValueCreate,
            namespace: "ns-1".to_string(),
            name: name.to_string(),
            payload: serde_json::json!({ "keeper": "kp-default-sql" }),
        }
    }

    #[tokio::test]
    async fn test_message_type_roundtrip() {
        for mt in [
            OutboxMessageType::SecureValueCreate,
            OutboxMessageType::SecureValueUpdate,
            OutboxMessageType::SecureValueDelete,
        ] {
            let parsed: OutboxMessageType = mt.as_str().parse().unwrap();
            assert_eq!(parsed, mt);
        }
        assert!("other".parse::<OutboxMessageType>().is_err());
    }

    #[tokio::test]
    async fn test_append_and_receive() {
        let db = TestDatabase::new().await;
        let queue = OutboxQueue::new(db.pool.clone());

        let id = queue.append(&db.pool, message("sv-1")).await.unwrap();

        let messages = queue.receive_n(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].message_type, OutboxMessageType::SecureValueCreate);
        assert_eq!(messages[0].name, "sv-1");
        assert_eq!(messages[0].payload["keeper"], "kp-default-sql");
    }

    #[tokio::test]
    async fn test_uncommitted_append_is_invisible() {
        let db = TestDatabase::new().await;
        let queue = OutboxQueue::new(db.pool.clone());

        {
            let mut tx = db.pool.begin().await.unwrap();
            queue.append(&mut *tx, message("sv-1")).await.unwrap();
            tx.rollback().await.unwrap();
        }
        assert!(queue.receive_n(10).await.unwrap().is_empty());

        let mut tx = db.pool.begin().await.unwrap();
        queue.append(&mut *tx, message("sv-2")).await.unwrap();
        tx.commit().await.unwrap();

        let messages = queue.receive_n(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name, "sv-2");
    }

    #[tokio::test]
    async fn test_undeleted_message_is_redelivered() {
        let db = TestDatabase::new().await;
        let queue = OutboxQueue::new(db.pool.clone());

        queue.append(&db.pool, message("sv-1")).await.unwrap();

        // consumer crashes before delete: the message comes back
        let first = queue.receive_n(10).await.unwrap();
        let second = queue.receive_n(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);

        queue.delete(first[0].id).await.unwrap();
        assert!(queue.receive_n(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_message_fails() {
        let db = TestDatabase::new().await;
        let queue = OutboxQueue::new(db.pool.clone());

        let err = queue.delete(12345).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_receive_n_respects_order_and_limit() {
        let db = TestDatabase::new().await;
        let queue = OutboxQueue::new(db.pool.clone());

        for name in ["sv-1", "sv-2", "sv-3"] {
            queue.append(&db.pool, message(name)).await.unwrap();
        }

        let first_two = queue.receive_n(2).await.unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].name, "sv-1");
        assert_eq!(first_two[1].name, "sv-2");

        // draining in order cannot starve the tail
        queue.delete(first_two[0].id).await.unwrap();
        queue.delete(first_two[1].id).await.unwrap();
        let rest = queue.receive_n(2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "sv-3");
    }
}
