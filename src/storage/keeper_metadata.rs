//! # Keeper Metadata Store
//!
//! Named keeper configurations per namespace. The reserved default name
//! resolves to the always-present built-in SQL keeper with no lookup; any
//! other name must resolve through a stored row whose payload deserializes
//! into the keeper-specific configuration.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;

use crate::errors::{KeepsakeError, Result};
use crate::secrets::keeper::{
    AwsKeeperConfig, GcpKeeperConfig, KeeperConfig, KeeperType, VaultKeeperConfig,
    DEFAULT_SQL_KEEPER,
};
use crate::storage::DbPool;

/// A stored keeper configuration.
#[derive(Debug, Clone, FromRow)]
pub struct KeeperMetadata {
    pub namespace: String,
    pub name: String,
    pub keeper_type: String,
    /// Keeper-specific configuration as JSON
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for keeper configuration rows.
#[derive(Clone)]
pub struct KeeperMetadataStore {
    pool: DbPool,
}

impl std::fmt::Debug for KeeperMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperMetadataStore").field("pool", &"[DbPool]").finish()
    }
}

impl KeeperMetadataStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a keeper row by namespace and name
    #[instrument(skip(self), fields(namespace = %namespace, name = %name), name = "db_get_keeper")]
    pub async fn get(&self, namespace: &str, name: &str) -> Result<KeeperMetadata> {
        sqlx::query_as::<sqlx::Sqlite, KeeperMetadata>(
            "SELECT namespace, name, keeper_type, payload, created_at, updated_at \
             FROM keeper_metadata WHERE namespace = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to get keeper '{}' in namespace '{}'", name, namespace),
        })?
        .ok_or_else(|| KeepsakeError::not_found("keeper", name))
    }

    /// Store or replace a keeper configuration row
    #[instrument(skip(self, payload), fields(namespace = %namespace, name = %name, keeper_type = %keeper_type), name = "db_save_keeper")]
    pub async fn save(
        &self,
        namespace: &str,
        name: &str,
        keeper_type: KeeperType,
        payload: &serde_json::Value,
    ) -> Result<()> {
        if name == DEFAULT_SQL_KEEPER {
            return Err(KeepsakeError::validation_field(
                format!("'{}' is reserved for the built-in keeper", DEFAULT_SQL_KEEPER),
                "name",
            ));
        }

        let payload = serde_json::to_string(payload).map_err(|e| {
            KeepsakeError::Serialization {
                source: e,
                context: format!("Failed to encode keeper payload for '{}'", name),
            }
        })?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO keeper_metadata (namespace, name, keeper_type, payload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (namespace, name) DO UPDATE SET \
               keeper_type = excluded.keeper_type, payload = excluded.payload, \
               updated_at = excluded.updated_at",
        )
        .bind(namespace)
        .bind(name)
        .bind(keeper_type.as_str())
        .bind(&payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to save keeper '{}' in namespace '{}'", name, namespace),
        })?;

        Ok(())
    }

    /// Resolve a keeper reference to its type and configuration. The
    /// reserved default name short-circuits to the built-in SQL keeper.
    #[instrument(skip(self), fields(namespace = %namespace, name = %name), name = "resolve_keeper_config")]
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<(KeeperType, KeeperConfig)> {
        if name == DEFAULT_SQL_KEEPER {
            return Ok((KeeperType::Sql, KeeperConfig::Sql));
        }

        let row = self.get(namespace, name).await?;

        let keeper_type = row.keeper_type.parse::<KeeperType>().map_err(|_| {
            KeepsakeError::internal(format!("Unknown keeper type stored for '{}'", name))
        })?;

        let config = match keeper_type {
            KeeperType::Sql => KeeperConfig::Sql,
            KeeperType::Vault => {
                let config: VaultKeeperConfig = serde_json::from_str(&row.payload).map_err(
                    |e| KeepsakeError::Serialization {
                        source: e,
                        context: format!("Failed to decode vault keeper config for '{}'", name),
                    },
                )?;
                KeeperConfig::Vault(config)
            }
            KeeperType::AwsSecretsManager => {
                let config: AwsKeeperConfig = serde_json::from_str(&row.payload).map_err(
                    |e| KeepsakeError::Serialization {
                        source: e,
                        context: format!("Failed to decode aws keeper config for '{}'", name),
                    },
                )?;
                KeeperConfig::AwsSecretsManager(config)
            }
            KeeperType::GcpSecretManager => {
                let config: GcpKeeperConfig = serde_json::from_str(&row.payload).map_err(
                    |e| KeepsakeError::Serialization {
                        source: e,
                        context: format!("Failed to decode gcp keeper config for '{}'", name),
                    },
                )?;
                KeeperConfig::GcpSecretManager(config)
            }
        };

        Ok((keeper_type, config))
    }
}
