//! # Resource Storage Backend
//!
//! The uniform contract every resource kind goes through: read latest, list
//! with continuation tokens, append-only history, write events, best-effort
//! live watch, and per-namespace stats. Durable delivery for secret writes is
//! the outbox queue's job; the watch channel here is a live tail only.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::errors::{KeepsakeError, Result};
use crate::storage::continuation::ContinuationToken;
use crate::storage::iterator::ListIterator;
use crate::storage::metadata::ResourceKey;
use crate::storage::DbPool;

/// Multiplier reserving low-order digits of a resource version for
/// sub-dividing concurrent updates that share one coarse timestamp.
const RESOURCE_VERSION_SCALE: i64 = 1000;

/// Buffer size of each watch subscriber channel.
const WATCH_BUFFER_SIZE: usize = 32;

/// Kind of write applied to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEventType {
    Added,
    Modified,
    Deleted,
}

impl WriteEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for WriteEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A write to apply through the backend.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub event_type: WriteEventType,
    pub key: ResourceKey,
    pub folder: String,
    /// Serialized resource document; ignored for deletes
    pub value: Vec<u8>,
    pub previous_resource_version: i64,
}

/// A committed write, as delivered to watch subscribers.
#[derive(Debug, Clone)]
pub struct WrittenEvent {
    pub event_type: WriteEventType,
    pub key: ResourceKey,
    pub folder: String,
    pub resource_version: i64,
}

/// Latest version of a resource as returned by reads.
#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub key: ResourceKey,
    pub folder: String,
    pub value: Vec<u8>,
    pub resource_version: i64,
}

/// Parameters of a list scan.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Scope of the scan; name may be empty to cover the namespace/resource
    pub key: ResourceKey,
    /// Must be zero: read-at-version is not supported, only "read latest and
    /// get back the version observed"
    pub resource_version: i64,
    /// Maximum rows fetched; non-positive means no limit
    pub limit: i64,
    /// Token from a previous scan, empty to start from the beginning
    pub continue_token: String,
}

/// Per-(group, resource) row counts for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStats {
    pub group: String,
    pub resource: String,
    pub count: i64,
}

/// Callback receiving the scan iterator exactly once.
pub type ListConsumer<'a> = &'a mut (dyn FnMut(&mut ListIterator) -> Result<()> + Send);

/// Contract every concrete resource storage backend implements.
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Read the latest version of a resource. A non-zero `resource_version`
    /// is invalid for this backend.
    async fn read(&self, key: &ResourceKey, resource_version: i64) -> Result<ReadResponse>;

    /// Stream matching rows through a [`ListIterator`], returning the list
    /// resource version observed at scan start.
    async fn list(&self, request: ListRequest, consume: ListConsumer<'_>) -> Result<i64>;

    /// Same iteration over the append-only history of a single name.
    async fn list_history(&self, request: ListRequest, consume: ListConsumer<'_>) -> Result<i64>;

    /// Apply a write, returning the new resource version.
    async fn write_event(&self, event: WriteEvent) -> Result<i64>;

    /// Subscribe to committed writes. Best-effort: a subscriber whose buffer
    /// is full misses events. The subscription ends when `cancel` fires.
    fn watch(&self, cancel: CancellationToken) -> mpsc::Receiver<WrittenEvent>;

    /// Row counts per (group, resource) within a namespace.
    async fn stats(&self, namespace: &str) -> Result<Vec<ResourceStats>>;
}

struct WatchSubscriber {
    id: u64,
    tx: mpsc::Sender<WrittenEvent>,
}

/// Fan-out hub for watch subscribers. Each backend instance owns its own
/// subscriber set; there is no ambient global.
struct WatchHub {
    subscribers: Mutex<Vec<WatchSubscriber>>,
    next_id: AtomicU64,
}

impl WatchHub {
    fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    fn subscribe(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<WrittenEvent> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .expect("watch subscriber lock poisoned")
            .push(WatchSubscriber { id, tx });

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            cancel.cancelled().await;
            hub.remove(id);
        });

        rx
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("watch subscriber lock poisoned")
            .retain(|sub| sub.id != id);
    }

    /// Deliver an event to every subscriber without ever blocking the write
    /// path: a full buffer drops this delivery, a closed receiver drops the
    /// subscription.
    fn publish(&self, event: &WrittenEvent) {
        let mut subscribers =
            self.subscribers.lock().expect("watch subscriber lock poisoned");
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    subscriber = sub.id,
                    name = %event.key.name,
                    "Watch subscriber buffer full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("watch subscriber lock poisoned").len()
    }
}

/// SQLite-backed resource storage.
#[derive(Clone)]
pub struct SqlResourceStorage {
    pool: DbPool,
    hub: Arc<WatchHub>,
    last_resource_version: Arc<AtomicI64>,
}

impl std::fmt::Debug for SqlResourceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlResourceStorage")
            .field("pool", &"[DbPool]")
            .field("subscribers", &self.hub.subscriber_count())
            .finish()
    }
}

impl SqlResourceStorage {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            hub: Arc::new(WatchHub::new()),
            last_resource_version: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Next resource version: the coarse millisecond timestamp scaled to
    /// reserve low-order digits, bumped past the previous version when
    /// several writes land in the same millisecond.
    fn next_resource_version(&self) -> i64 {
        let candidate = Utc::now().timestamp_millis() * RESOURCE_VERSION_SCALE;
        let mut prev = self.last_resource_version.load(Ordering::SeqCst);
        loop {
            let next = candidate.max(prev + 1);
            match self.last_resource_version.compare_exchange(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn require_full_key(key: &ResourceKey) -> Result<()> {
        if key.group.is_empty()
            || key.resource.is_empty()
            || key.namespace.is_empty()
            || key.name.is_empty()
        {
            return Err(KeepsakeError::validation(
                "group, resource, namespace, and name are required",
            ));
        }
        Ok(())
    }

    /// High-watermark of the `updated` column, scaled: "latest known version
    /// as of the scan start". Opaque to callers beyond "larger means newer".
    async fn list_resource_version(&self) -> Result<i64> {
        let max_updated: Option<i64> =
            sqlx::query_scalar("SELECT MAX(updated) FROM resource")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| KeepsakeError::Database {
                    source: e,
                    context: "Failed to compute list resource version".to_string(),
                })?;

        Ok(max_updated.unwrap_or(0) * RESOURCE_VERSION_SCALE)
    }

    async fn run_scan(
        &self,
        request: &ListRequest,
        history: bool,
        consume: ListConsumer<'_>,
    ) -> Result<i64> {
        if request.resource_version != 0 {
            return Err(KeepsakeError::validation_field(
                "reading at an explicit resource version is not supported",
                "resource_version",
            ));
        }

        let token = ContinuationToken::decode(&request.continue_token)?;
        let list_rv = self.list_resource_version().await?;

        let key = &request.key;
        if key.group.is_empty() || key.resource.is_empty() || key.namespace.is_empty() {
            return Err(KeepsakeError::validation(
                "group, resource, and namespace are required",
            ));
        }
        if history {
            Self::require_full_key(key)?;
        }

        let table = if history { "resource_history" } else { "resource" };
        let limit = if request.limit > 0 { request.limit } else { -1 };

        let rows = if key.name.is_empty() {
            let sql = format!(
                "SELECT id, namespace, name, folder, value, resource_version FROM {} \
                 WHERE api_group = ? AND resource = ? AND namespace = ? AND id > ? \
                 ORDER BY id ASC LIMIT ?",
                table
            );
            sqlx::query(&sql)
                .bind(&key.group)
                .bind(&key.resource)
                .bind(&key.namespace)
                .bind(token.id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            let sql = format!(
                "SELECT id, namespace, name, folder, value, resource_version FROM {} \
                 WHERE api_group = ? AND resource = ? AND namespace = ? AND name = ? AND id > ? \
                 ORDER BY id ASC LIMIT ?",
                table
            );
            sqlx::query(&sql)
                .bind(&key.group)
                .bind(&key.resource)
                .bind(&key.namespace)
                .bind(&key.name)
                .bind(token.id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to scan {} for '{}'", table, key.name),
        })?;

        let mut iter = ListIterator::new(rows, token);
        let consume_result = consume(&mut iter);
        let terminal = iter.take_error();
        iter.close();

        consume_result?;
        if let Some(err) = terminal {
            return Err(err);
        }

        Ok(list_rv)
    }
}

#[async_trait]
impl ResourceStorage for SqlResourceStorage {
    #[instrument(skip(self, key), fields(name = %key.name), name = "db_read_resource")]
    async fn read(&self, key: &ResourceKey, resource_version: i64) -> Result<ReadResponse> {
        if resource_version != 0 {
            return Err(KeepsakeError::validation_field(
                "reading at an explicit resource version is not supported",
                "resource_version",
            ));
        }
        Self::require_full_key(key)?;

        let row = sqlx::query(
            "SELECT folder, value, resource_version FROM resource \
             WHERE api_group = ? AND resource = ? AND namespace = ? AND name = ?",
        )
        .bind(&key.group)
        .bind(&key.resource)
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to read resource '{}'", key.name),
        })?
        .ok_or_else(|| KeepsakeError::not_found("resource", key.name.clone()))?;

        use sqlx::Row;
        Ok(ReadResponse {
            key: key.clone(),
            folder: row.try_get("folder")?,
            value: row.try_get("value")?,
            resource_version: row.try_get("resource_version")?,
        })
    }

    #[instrument(skip(self, request, consume), fields(resource = %request.key.resource), name = "db_list_resources")]
    async fn list(&self, request: ListRequest, consume: ListConsumer<'_>) -> Result<i64> {
        self.run_scan(&request, false, consume).await
    }

    #[instrument(skip(self, request, consume), fields(name = %request.key.name), name = "db_list_history")]
    async fn list_history(&self, request: ListRequest, consume: ListConsumer<'_>) -> Result<i64> {
        self.run_scan(&request, true, consume).await
    }

    #[instrument(skip(self, event), fields(name = %event.key.name, event_type = %event.event_type), name = "db_write_event")]
    async fn write_event(&self, event: WriteEvent) -> Result<i64> {
        Self::require_full_key(&event.key)?;
        if event.event_type != WriteEventType::Deleted && event.value.is_empty() {
            return Err(KeepsakeError::validation_field("value is required", "value"));
        }

        // A caller that names the version it last observed gets a conflict
        // instead of silently clobbering a concurrent write.
        if event.previous_resource_version != 0 {
            let current = self.read(&event.key, 0).await?;
            if current.resource_version != event.previous_resource_version {
                return Err(KeepsakeError::conflict(
                    format!(
                        "resource '{}' changed: expected version {}, found {}",
                        event.key.name, event.previous_resource_version, current.resource_version
                    ),
                    "resource",
                ));
            }
        }

        let resource_version = self.next_resource_version();
        let updated = resource_version / RESOURCE_VERSION_SCALE;
        let key = &event.key;

        let mut tx = self.pool.begin().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to begin write transaction for '{}'", key.name),
        })?;

        match event.event_type {
            WriteEventType::Added | WriteEventType::Modified => {
                sqlx::query(
                    "INSERT INTO resource (api_group, resource, namespace, name, folder, value, resource_version, updated) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (api_group, resource, namespace, name) DO UPDATE SET \
                       folder = excluded.folder, value = excluded.value, \
                       resource_version = excluded.resource_version, updated = excluded.updated",
                )
                .bind(&key.group)
                .bind(&key.resource)
                .bind(&key.namespace)
                .bind(&key.name)
                .bind(&event.folder)
                .bind(&event.value)
                .bind(resource_version)
                .bind(updated)
                .execute(&mut *tx)
                .await
                .map_err(|e| KeepsakeError::Database {
                    source: e,
                    context: format!("Failed to upsert resource '{}'", key.name),
                })?;
            }
            WriteEventType::Deleted => {
                sqlx::query(
                    "DELETE FROM resource \
                     WHERE api_group = ? AND resource = ? AND namespace = ? AND name = ?",
                )
                .bind(&key.group)
                .bind(&key.resource)
                .bind(&key.namespace)
                .bind(&key.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| KeepsakeError::Database {
                    source: e,
                    context: format!("Failed to delete resource '{}'", key.name),
                })?;
            }
        }

        sqlx::query(
            "INSERT INTO resource_history (api_group, resource, namespace, name, folder, value, resource_version, action, updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.group)
        .bind(&key.resource)
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(&event.folder)
        .bind(&event.value)
        .bind(resource_version)
        .bind(event.event_type.as_str())
        .bind(updated)
        .execute(&mut *tx)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to append history for '{}'", key.name),
        })?;

        tx.commit().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to commit write for '{}'", key.name),
        })?;

        self.hub.publish(&WrittenEvent {
            event_type: event.event_type,
            key: event.key.clone(),
            folder: event.folder.clone(),
            resource_version,
        });

        tracing::info!(
            name = %event.key.name,
            event_type = %event.event_type,
            resource_version,
            "Applied write event"
        );

        Ok(resource_version)
    }

    fn watch(&self, cancel: CancellationToken) -> mpsc::Receiver<WrittenEvent> {
        self.hub.subscribe(cancel)
    }

    #[instrument(skip(self), fields(namespace = %namespace), name = "db_resource_stats")]
    async fn stats(&self, namespace: &str) -> Result<Vec<ResourceStats>> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT api_group, resource, COUNT(*) AS count FROM resource \
             WHERE namespace = ? GROUP BY api_group, resource ORDER BY api_group, resource",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to compute stats for namespace '{}'", namespace),
        })?;

        rows.into_iter()
            .map(|row| {
                Ok(ResourceStats {
                    group: row.try_get("api_group")?,
                    resource: row.try_get("resource")?,
                    count: row.try_get("count")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: "Failed to decode stats row".to_string(),
            })
    }
}
