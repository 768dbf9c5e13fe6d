//! # Decrypt Storage
//!
//! The only read path that yields secret plaintext. Kept separate from
//! [`SecureValueStorage`](crate::storage::secure_value::SecureValueStorage)
//! so every call site that can see plaintext is a distinct, auditable entry
//! point.

use sqlx::FromRow;
use std::sync::Arc;
use tracing::instrument;

use crate::auth::RequestContext;
use crate::errors::{KeepsakeError, Result};
use crate::secrets::keeper::ExternalId;
use crate::secrets::registry::KeeperRegistry;
use crate::secrets::types::SecretString;
use crate::storage::keeper_metadata::KeeperMetadataStore;
use crate::storage::DbPool;

#[derive(Debug, Clone, FromRow)]
struct DecryptRow {
    pub keeper: String,
    pub external_id: String,
}

/// Read-only path resolving a secure value's keeper and exposing plaintext.
#[derive(Clone)]
pub struct DecryptStorage {
    pool: DbPool,
    keepers: Arc<KeeperRegistry>,
    keeper_metadata: KeeperMetadataStore,
}

impl std::fmt::Debug for DecryptStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptStorage")
            .field("pool", &"[DbPool]")
            .field("keepers", &self.keepers)
            .finish()
    }
}

impl DecryptStorage {
    pub fn new(pool: DbPool, keepers: Arc<KeeperRegistry>) -> Self {
        Self { keeper_metadata: KeeperMetadataStore::new(pool.clone()), pool, keepers }
    }

    /// Expose the plaintext of a secure value.
    #[instrument(skip(self, ctx), fields(namespace = %namespace, name = %name), name = "secure_value_decrypt")]
    pub async fn decrypt(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<SecretString> {
        ctx.require_auth()?;

        let row = sqlx::query_as::<sqlx::Sqlite, DecryptRow>(
            "SELECT keeper, external_id FROM secure_value WHERE namespace = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!(
                "Failed to get secure value '{}' in namespace '{}'",
                name, namespace
            ),
        })?
        .ok_or_else(|| KeepsakeError::not_found("secure_value", name))?;

        let (keeper_type, keeper_config) =
            self.keeper_metadata.resolve(namespace, &row.keeper).await?;
        let keeper = self.keepers.get(keeper_type)?;

        let external_id = ExternalId::from_string(row.external_id);
        let exposed = keeper.expose(&keeper_config, namespace, &external_id).await?;

        tracing::info!(namespace = %namespace, name = %name, "Exposed secure value plaintext");

        Ok(exposed)
    }
}
