//! # Storage and Persistence
//!
//! Database connectivity and the storage backends of the keepsake layer:
//! the versioned metadata store over an ordered key-value substrate, the
//! generic resource storage contract with token-based pagination and a live
//! watch channel, secure-value metadata with keeper-delegated plaintext, and
//! the transactional outbox feeding asynchronous consumers.

pub mod continuation;
pub mod decrypt;
pub mod iterator;
pub mod keeper_metadata;
pub mod kv;
pub mod metadata;
pub mod migrations;
pub mod outbox;
pub mod pool;
pub mod resource;
pub mod secure_value;

#[cfg(test)]
pub mod test_helpers;

pub use crate::config::DatabaseConfig;

pub use continuation::ContinuationToken;
pub use decrypt::DecryptStorage;
pub use iterator::{ListIterator, RejectedRow, MAX_REJECTED_ROWS};
pub use keeper_metadata::{KeeperMetadata, KeeperMetadataStore};
pub use kv::{prefix_range_end, Kv, KvEntry, ListKeysOptions, SortOrder, SqlKv};
pub use metadata::{new_version_uid, MetaData, MetaDataObj, MetadataStore, ResourceKey};
pub use migrations::{
    get_migration_version, list_applied_migrations, run_migrations as run_db_migrations,
    MigrationInfo,
};
pub use outbox::{AppendOutboxMessage, OutboxMessage, OutboxMessageType, OutboxQueue};
pub use pool::{create_pool, get_pool_stats, DbPool, PoolStats};
pub use resource::{
    ListRequest, ReadResponse, ResourceStats, ResourceStorage, SqlResourceStorage, WriteEvent,
    WriteEventType, WrittenEvent,
};
pub use secure_value::{
    CreateSecureValueRequest, LabelSelector, SecureValueData, SecureValueStorage,
    UpdateSecureValueRequest,
};

use crate::errors::{KeepsakeError, Result};

/// Run database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    migrations::run_migrations(pool).await
}

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| KeepsakeError::Database {
        source: e,
        context: "Database connectivity check failed".to_string(),
    })?;

    Ok(())
}
