//! Built-in SQL keeper
//!
//! The always-available keeper backing the reserved default keeper name. It
//! encrypts values with AES-256-GCM and persists the ciphertext in the local
//! database, so secret material never leaves the deployment.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::FromRow;
use tracing::instrument;

use crate::errors::{KeepsakeError, Result};
use crate::secrets::encryption::SecretEncryption;
use crate::secrets::keeper::{ExternalId, Keeper, KeeperConfig, KeeperType};
use crate::secrets::types::SecretString;
use crate::storage::DbPool;

#[derive(Debug, Clone, FromRow)]
struct SecretValueRow {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Keeper storing encrypted secret values in the `secret_value` table.
#[derive(Clone)]
pub struct SqlKeeper {
    pool: DbPool,
    encryption: SecretEncryption,
}

impl SqlKeeper {
    pub fn new(pool: DbPool, encryption: SecretEncryption) -> Self {
        Self { pool, encryption }
    }
}

impl std::fmt::Debug for SqlKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlKeeper")
            .field("pool", &"[DbPool]")
            .field("encryption", &self.encryption)
            .finish()
    }
}

#[async_trait]
impl Keeper for SqlKeeper {
    #[instrument(skip(self, _config, value), fields(namespace = %namespace), name = "keeper_sql_store")]
    async fn store(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        value: SecretString,
    ) -> Result<ExternalId> {
        let external_id = ExternalId::new();
        let (ciphertext, nonce) = self.encryption.encrypt(value.expose_secret().as_bytes())?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO secret_value (namespace, external_id, ciphertext, nonce, key_version, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(namespace)
        .bind(external_id.as_str())
        .bind(&ciphertext)
        .bind(&nonce)
        .bind(self.encryption.key_version())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, namespace = %namespace, "Failed to store secret value");
            KeepsakeError::Database {
                source: e,
                context: format!("Failed to store secret value in namespace '{}'", namespace),
            }
        })?;

        tracing::info!(namespace = %namespace, external_id = %external_id, "Stored secret value");

        Ok(external_id)
    }

    #[instrument(skip(self, _config, value), fields(namespace = %namespace, external_id = %external_id), name = "keeper_sql_update")]
    async fn update(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
        value: SecretString,
    ) -> Result<()> {
        let (ciphertext, nonce) = self.encryption.encrypt(value.expose_secret().as_bytes())?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE secret_value SET ciphertext = ?, nonce = ?, key_version = ?, updated_at = ? \
             WHERE namespace = ? AND external_id = ?",
        )
        .bind(&ciphertext)
        .bind(&nonce)
        .bind(self.encryption.key_version())
        .bind(now)
        .bind(namespace)
        .bind(external_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to update secret value in namespace '{}'", namespace),
        })?;

        if result.rows_affected() == 0 {
            return Err(KeepsakeError::not_found("secret_value", external_id.as_str()));
        }

        Ok(())
    }

    #[instrument(skip(self, _config), fields(namespace = %namespace, external_id = %external_id), name = "keeper_sql_expose")]
    async fn expose(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
    ) -> Result<SecretString> {
        let row = sqlx::query_as::<sqlx::Sqlite, SecretValueRow>(
            "SELECT ciphertext, nonce FROM secret_value WHERE namespace = ? AND external_id = ?",
        )
        .bind(namespace)
        .bind(external_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to read secret value in namespace '{}'", namespace),
        })?
        .ok_or_else(|| KeepsakeError::not_found("secret_value", external_id.as_str()))?;

        let plaintext = self.encryption.decrypt(&row.ciphertext, &row.nonce)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| KeepsakeError::internal("Invalid UTF-8 in decrypted secret value"))?;

        Ok(SecretString::new(plaintext))
    }

    #[instrument(skip(self, _config), fields(namespace = %namespace, external_id = %external_id), name = "keeper_sql_delete")]
    async fn delete(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM secret_value WHERE namespace = ? AND external_id = ?")
            .bind(namespace)
            .bind(external_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: format!("Failed to delete secret value in namespace '{}'", namespace),
            })?;

        Ok(())
    }

    fn keeper_type(&self) -> KeeperType {
        KeeperType::Sql
    }
}
