//! # Database Migration Management
//!
//! Handles schema evolution using SQL migrations embedded in the binary,
//! applied in version order and tracked in a `schema_migrations` table.

use crate::errors::{KeepsakeError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

/// Migration information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub installed_on: DateTime<Utc>,
}

const MIGRATION_0001_KV_AND_RESOURCE: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS resource (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    api_group TEXT NOT NULL,
    resource TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    folder TEXT NOT NULL DEFAULT '',
    value BLOB NOT NULL,
    resource_version INTEGER NOT NULL,
    updated INTEGER NOT NULL,
    UNIQUE (api_group, resource, namespace, name)
);

CREATE TABLE IF NOT EXISTS resource_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    api_group TEXT NOT NULL,
    resource TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    folder TEXT NOT NULL DEFAULT '',
    value BLOB NOT NULL,
    resource_version INTEGER NOT NULL,
    action TEXT NOT NULL,
    updated INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resource_history_key
    ON resource_history (api_group, resource, namespace, name, id);
"#;

const MIGRATION_0002_SECRET_STORAGE: &str = r#"
CREATE TABLE IF NOT EXISTS secure_value (
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    keeper TEXT NOT NULL,
    external_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    labels TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    created_by TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    PRIMARY KEY (namespace, name)
);

CREATE TABLE IF NOT EXISTS keeper_metadata (
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    keeper_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, name)
);

CREATE TABLE IF NOT EXISTS secret_value (
    namespace TEXT NOT NULL,
    external_id TEXT NOT NULL,
    ciphertext BLOB NOT NULL,
    nonce BLOB NOT NULL,
    key_version TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, external_id)
);
"#;

const MIGRATION_0003_OUTBOX: &str = r#"
CREATE TABLE IF NOT EXISTS secret_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_type TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
"#;

/// All migrations in application order
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "kv_and_resource_tables", MIGRATION_0001_KV_AND_RESOURCE),
    (2, "secret_storage_tables", MIGRATION_0002_SECRET_STORAGE),
    (3, "secret_outbox_table", MIGRATION_0003_OUTBOX),
];

/// Run all pending database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    create_migration_table(pool).await?;

    let applied = get_applied_migration_versions(pool).await?;

    let mut migrations_run = 0;
    for (version, description, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        sqlx::raw_sql(sql).execute(pool).await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to apply migration {} ({})", version, description),
        })?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, description, installed_on) VALUES (?, ?, ?)",
        )
        .bind(version)
        .bind(description)
        .bind(Utc::now())
        .execute(pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to record migration {}", version),
        })?;

        info!(version = version, description = description, "Applied migration");
        migrations_run += 1;
    }

    if migrations_run > 0 {
        info!(migrations_run, "Database migrations complete");
    }

    Ok(())
}

/// List all applied migrations in version order
pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<MigrationInfo>> {
    let rows = sqlx::query(
        "SELECT version, description, installed_on FROM schema_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| KeepsakeError::Database {
        source: e,
        context: "Failed to list applied migrations".to_string(),
    })?;

    rows.into_iter()
        .map(|row| {
            Ok(MigrationInfo {
                version: row.try_get("version")?,
                description: row.try_get("description")?,
                installed_on: row.try_get("installed_on")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: "Failed to decode migration row".to_string(),
        })
}

/// Get the latest applied migration version, or 0 when none has run
pub async fn get_migration_version(pool: &DbPool) -> Result<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(pool)
            .await
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: "Failed to read migration version".to_string(),
            })?;

    Ok(version.unwrap_or(0))
}

async fn create_migration_table(pool: &DbPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            installed_on TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| KeepsakeError::Database {
        source: e,
        context: "Failed to create schema_migrations table".to_string(),
    })?;

    Ok(())
}

async fn get_applied_migration_versions(pool: &DbPool) -> Result<Vec<i64>> {
    sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: "Failed to read applied migrations".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::raw_memory_pool;

    #[tokio::test]
    async fn test_run_migrations_applies_all() {
        let pool = raw_memory_pool().await;

        run_migrations(&pool).await.unwrap();

        let version = get_migration_version(&pool).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().0);

        let applied = list_applied_migrations(&pool).await.unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());
        assert_eq!(applied[0].description, "kv_and_resource_tables");
    }

    #[tokio::test]
    async fn test_run_migrations_is_idempotent() {
        let pool = raw_memory_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let applied = list_applied_migrations(&pool).await.unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn test_migration_version_empty_database() {
        let pool = raw_memory_pool().await;
        create_migration_table(&pool).await.unwrap();
        assert_eq!(get_migration_version(&pool).await.unwrap(), 0);
    }
}
