//! Test database utilities for in-library tests.
//!
//! Provides self-contained in-memory SQLite databases with all migrations
//! applied, plus ready-wired storage fixtures. A single-connection pool keeps
//! every handle on the same in-memory database.
//!
//! This module is only compiled in test builds.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::auth::{Identity, RequestContext};
use crate::secrets::encryption::{SecretEncryption, SecretEncryptionConfig};
use crate::secrets::registry::KeeperRegistry;
use crate::storage::decrypt::DecryptStorage;
use crate::storage::secure_value::SecureValueStorage;
use crate::storage::DbPool;

/// Identity used by [`authed_context`].
pub const TEST_IDENTITY_UID: &str = "test-user";

/// Build a raw single-connection in-memory pool with no schema applied.
pub async fn raw_memory_pool() -> DbPool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("in-memory connection options are valid");

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await
        .expect("failed to open in-memory database")
}

/// A test database with all migrations applied.
pub struct TestDatabase {
    pub pool: DbPool,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let pool = raw_memory_pool().await;
        crate::storage::migrations::run_migrations(&pool)
            .await
            .expect("failed to run migrations on test database");
        Self { pool }
    }
}

/// Encryption service with a fixed test key.
pub fn test_encryption() -> SecretEncryption {
    SecretEncryption::new(&SecretEncryptionConfig::for_testing())
        .expect("test encryption config is valid")
}

/// Keeper registry holding only the built-in SQL keeper.
pub fn test_keeper_registry(pool: &DbPool) -> Arc<KeeperRegistry> {
    Arc::new(KeeperRegistry::with_sql_keeper(pool.clone(), test_encryption()))
}

/// Secure value storage wired against the test database.
pub fn secure_value_storage(db: &TestDatabase) -> SecureValueStorage {
    SecureValueStorage::new(db.pool.clone(), test_keeper_registry(&db.pool))
}

/// Decrypt storage wired against the test database.
pub fn decrypt_storage(db: &TestDatabase) -> DecryptStorage {
    DecryptStorage::new(db.pool.clone(), test_keeper_registry(&db.pool))
}

/// Context authenticated as [`TEST_IDENTITY_UID`].
pub fn authed_context() -> RequestContext {
    RequestContext::authenticated(Identity::user(TEST_IDENTITY_UID))
}
