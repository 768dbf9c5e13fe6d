//! # Ordered Key-Value Substrate
//!
//! The metadata store is built on a small ordered key-value contract: get,
//! insert, save, delete, and lexicographic range scans with a sort order and
//! limit. The SQLite implementation keeps everything in a single `kv` table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::instrument;

use crate::errors::{KeepsakeError, Result};
use crate::storage::DbPool;

/// Scan direction for [`Kv::list_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Options for a key range scan. Keys in `[start_key, end_key)` are returned
/// in `sort` order; an empty `end_key` means no upper bound and a
/// non-positive `limit` means no limit.
#[derive(Debug, Clone, Default)]
pub struct ListKeysOptions {
    pub start_key: String,
    pub end_key: String,
    pub sort: SortOrder,
    pub limit: i64,
}

/// A stored key-value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Ordered key-value storage contract.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Fetch an entry; fails NotFound when the key is absent.
    async fn get(&self, key: &str) -> Result<KvEntry>;

    /// Write a key, failing with Conflict if it already exists.
    async fn insert(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Write a key, replacing any existing value.
    async fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Scan keys in a lexicographic range.
    async fn list_keys(&self, options: ListKeysOptions) -> Result<Vec<String>>;
}

/// The smallest key strictly greater than every key carrying `prefix`, for
/// use as the exclusive upper bound of a prefix scan. Returns an empty string
/// (no upper bound) when no such key exists.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last_mut() {
        if *last < 0xff {
            *last += 1;
            return String::from_utf8(bytes)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        }
        bytes.pop();
    }
    String::new()
}

/// SQLite-backed ordered key-value store.
#[derive(Clone)]
pub struct SqlKv {
    pool: DbPool,
}

impl SqlKv {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for SqlKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlKv").field("pool", &"[DbPool]").finish()
    }
}

#[async_trait]
impl Kv for SqlKv {
    #[instrument(skip(self), fields(key = %key), name = "db_kv_get")]
    async fn get(&self, key: &str) -> Result<KvEntry> {
        let row = sqlx::query("SELECT key, value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: format!("Failed to get key '{}'", key),
            })?
            .ok_or_else(|| KeepsakeError::not_found("kv", key))?;

        Ok(KvEntry { key: row.try_get("key")?, value: row.try_get("value")? })
    }

    #[instrument(skip(self, value), fields(key = %key), name = "db_kv_insert")]
    async fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = Utc::now();
        sqlx::query("INSERT INTO kv (key, value, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                    KeepsakeError::conflict(format!("Key '{}' already exists", key), "kv")
                } else {
                    KeepsakeError::Database {
                        source: e,
                        context: format!("Failed to insert key '{}'", key),
                    }
                }
            })?;

        Ok(())
    }

    #[instrument(skip(self, value), fields(key = %key), name = "db_kv_save")]
    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO kv (key, value, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to save key '{}'", key),
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), name = "db_kv_delete")]
    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?").bind(key).execute(&self.pool).await.map_err(
            |e| KeepsakeError::Database {
                source: e,
                context: format!("Failed to delete key '{}'", key),
            },
        )?;

        Ok(())
    }

    #[instrument(skip(self), fields(start_key = %options.start_key, limit = options.limit), name = "db_kv_list_keys")]
    async fn list_keys(&self, options: ListKeysOptions) -> Result<Vec<String>> {
        let order = match options.sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let limit = if options.limit > 0 { options.limit } else { -1 };

        let keys = if options.end_key.is_empty() {
            let sql = format!("SELECT key FROM kv WHERE key >= ? ORDER BY key {} LIMIT ?", order);
            sqlx::query_scalar::<sqlx::Sqlite, String>(&sql)
                .bind(&options.start_key)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            let sql = format!(
                "SELECT key FROM kv WHERE key >= ? AND key < ? ORDER BY key {} LIMIT ?",
                order
            );
            sqlx::query_scalar::<sqlx::Sqlite, String>(&sql)
                .bind(&options.start_key)
                .bind(&options.end_key)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        };

        keys.map_err(|e| KeepsakeError::Database {
            source: e,
            context: "Failed to list keys".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    #[tokio::test]
    async fn test_kv_save_get_delete() {
        let db = TestDatabase::new().await;
        let kv = SqlKv::new(db.pool.clone());

        kv.save("/a/1", b"one").await.unwrap();
        let entry = kv.get("/a/1").await.unwrap();
        assert_eq!(entry.key, "/a/1");
        assert_eq!(entry.value, b"one");

        kv.save("/a/1", b"uno").await.unwrap();
        assert_eq!(kv.get("/a/1").await.unwrap().value, b"uno");

        kv.delete("/a/1").await.unwrap();
        let err = kv.get("/a/1").await.unwrap_err();
        assert!(err.is_not_found());

        // deleting an absent key is not an error
        kv.delete("/a/1").await.unwrap();
    }

    #[tokio::test]
    async fn test_kv_insert_rejects_existing_key() {
        let db = TestDatabase::new().await;
        let kv = SqlKv::new(db.pool.clone());

        kv.insert("/a/1", b"one").await.unwrap();
        let err = kv.insert("/a/1", b"two").await.unwrap_err();
        assert!(matches!(err, KeepsakeError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_kv_range_scan_ordering_and_limit() {
        let db = TestDatabase::new().await;
        let kv = SqlKv::new(db.pool.clone());

        for key in ["/p/a", "/p/b", "/p/c", "/q/a"] {
            kv.save(key, b"x").await.unwrap();
        }

        let asc = kv
            .list_keys(ListKeysOptions {
                start_key: "/p/".to_string(),
                end_key: prefix_range_end("/p/"),
                sort: SortOrder::Asc,
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(asc, vec!["/p/a", "/p/b", "/p/c"]);

        let desc_limited = kv
            .list_keys(ListKeysOptions {
                start_key: "/p/".to_string(),
                end_key: prefix_range_end("/p/"),
                sort: SortOrder::Desc,
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(desc_limited, vec!["/p/c"]);
    }

    #[tokio::test]
    async fn test_kv_scan_without_upper_bound() {
        let db = TestDatabase::new().await;
        let kv = SqlKv::new(db.pool.clone());

        kv.save("/p/a", b"x").await.unwrap();
        kv.save("/q/a", b"x").await.unwrap();

        let all = kv
            .list_keys(ListKeysOptions { start_key: "/p/".to_string(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all, vec!["/p/a", "/q/a"]);
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/p/"), "/p0");
        assert_eq!(prefix_range_end("abc"), "abd");
        assert_eq!(prefix_range_end(""), "");
    }
}
