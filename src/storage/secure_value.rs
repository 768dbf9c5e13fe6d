//! # Secure Value Storage
//!
//! CRUD over secret *metadata*. The queryable row never holds plaintext:
//! secret material goes to the resolved keeper first, and only the opaque
//! external identifier the keeper returns is persisted. Every metadata
//! mutation shares a transaction with an outbox append so consumers always
//! see the pair together.
//!
//! State machine per `(namespace, name)`:
//! absent -> active -> (updated)* -> deleted. No two active rows may share a
//! key; a delete frees the key for a fresh create.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::auth::RequestContext;
use crate::errors::{KeepsakeError, Result};
use crate::secrets::keeper::DEFAULT_SQL_KEEPER;
use crate::secrets::registry::KeeperRegistry;
use crate::secrets::types::SecretString;
use crate::storage::keeper_metadata::KeeperMetadataStore;
use crate::storage::outbox::{AppendOutboxMessage, OutboxMessageType, OutboxQueue};
use crate::storage::DbPool;

/// A label selector evaluated client-side against a value's labels.
///
/// Accepts the comma-separated forms `key` (key must exist) and `key=value`
/// (key must equal value); all requirements must hold. An empty selector
/// selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelRequirement {
    Exists(String),
    Equals(String, String),
}

impl LabelSelector {
    /// Selector matching every value.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for part in selector.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(KeepsakeError::validation(format!(
                            "Invalid label selector: '{}'",
                            selector
                        )));
                    }
                    requirements
                        .push(LabelRequirement::Equals(key.to_string(), value.trim().to_string()));
                }
                None => requirements.push(LabelRequirement::Exists(part.to_string())),
            }
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|requirement| match requirement {
            LabelRequirement::Exists(key) => labels.contains_key(key),
            LabelRequirement::Equals(key, value) => {
                labels.get(key).map(String::as_str) == Some(value.as_str())
            }
        })
    }

    pub fn selects_all(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Request to create a secure value. The plaintext travels only here; it is
/// handed to the keeper and never persisted or returned.
#[derive(Debug, Clone)]
pub struct CreateSecureValueRequest {
    pub namespace: String,
    pub name: String,
    pub title: String,
    /// Keeper reference; `None` means the built-in default keeper
    pub keeper: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub value: SecretString,
}

/// Request to update an existing secure value.
#[derive(Debug, Clone)]
pub struct UpdateSecureValueRequest {
    pub namespace: String,
    pub name: String,
    pub title: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    /// New plaintext; `None` keeps the keeper-held value unchanged
    pub value: Option<SecretString>,
}

/// Secure value metadata as returned to callers. `value` exists so callers
/// can rely on the cleared-plaintext contract; storage always returns `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureValueData {
    pub namespace: String,
    pub name: String,
    pub title: String,
    pub keeper: String,
    pub external_id: String,
    pub version: i64,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<SecretString>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, FromRow)]
struct SecureValueRow {
    pub namespace: String,
    pub name: String,
    pub title: String,
    pub keeper: String,
    pub external_id: String,
    pub version: i64,
    pub labels: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl SecureValueRow {
    fn into_data(self) -> Result<SecureValueData> {
        let labels: BTreeMap<String, String> =
            serde_json::from_str(&self.labels).map_err(|e| KeepsakeError::Serialization {
                source: e,
                context: format!("Failed to decode labels for secure value '{}'", self.name),
            })?;

        Ok(SecureValueData {
            namespace: self.namespace,
            name: self.name,
            title: self.title,
            keeper: self.keeper,
            external_id: self.external_id,
            version: self.version,
            labels,
            value: None,
            created_at: self.created_at,
            created_by: self.created_by,
            updated_at: self.updated_at,
            updated_by: self.updated_by,
        })
    }
}

const SELECT_COLUMNS: &str = "namespace, name, title, keeper, external_id, version, labels, \
                              created_at, created_by, updated_at, updated_by";

/// Storage for secure value metadata, delegating plaintext to keepers.
#[derive(Clone)]
pub struct SecureValueStorage {
    pool: DbPool,
    keepers: Arc<KeeperRegistry>,
    keeper_metadata: KeeperMetadataStore,
    outbox: OutboxQueue,
}

impl std::fmt::Debug for SecureValueStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureValueStorage")
            .field("pool", &"[DbPool]")
            .field("keepers", &self.keepers)
            .finish()
    }
}

impl SecureValueStorage {
    pub fn new(pool: DbPool, keepers: Arc<KeeperRegistry>) -> Self {
        Self {
            keeper_metadata: KeeperMetadataStore::new(pool.clone()),
            outbox: OutboxQueue::new(pool.clone()),
            pool,
            keepers,
        }
    }

    /// The outbox queue fed by this storage, for wiring consumers.
    pub fn outbox(&self) -> &OutboxQueue {
        &self.outbox
    }

    async fn fetch_row(&self, namespace: &str, name: &str) -> Result<Option<SecureValueRow>> {
        let sql = format!(
            "SELECT {} FROM secure_value WHERE namespace = ? AND name = ?",
            SELECT_COLUMNS
        );
        sqlx::query_as::<sqlx::Sqlite, SecureValueRow>(&sql)
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
            })
    }

    /// Create a new secure value.
    ///
    /// The plaintext is stored in the resolved keeper first; only after that
    /// succeeds is the metadata row inserted, in the same transaction as the
    /// outbox message announcing it.
    #[instrument(skip(self, ctx, request), fields(namespace = %request.namespace, name = %request.name), name = "secure_value_create")]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        request: CreateSecureValueRequest,
    ) -> Result<SecureValueData> {
        let identity = ctx.require_auth()?;

        if request.namespace.is_empty() {
            return Err(KeepsakeError::validation_field("namespace is required", "namespace"));
        }
        if request.name.is_empty() {
            return Err(KeepsakeError::validation_field("name is required", "name"));
        }
        if request.value.is_empty() {
            return Err(KeepsakeError::validation_field("value is required", "value"));
        }

        let keeper_name =
            request.keeper.clone().unwrap_or_else(|| DEFAULT_SQL_KEEPER.to_string());
        let (keeper_type, keeper_config) =
            self.keeper_metadata.resolve(&request.namespace, &keeper_name).await?;
        let keeper = self.keepers.get(keeper_type)?;

        // Store in keeper. From this point on the plaintext is not needed.
        let external_id =
            keeper.store(&keeper_config, &request.namespace, request.value).await?;

        let labels = serde_json::to_string(&request.labels).map_err(|e| {
            KeepsakeError::Serialization {
                source: e,
                context: format!("Failed to encode labels for '{}'", request.name),
            }
        })?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to begin create transaction for '{}'", request.name),
        })?;

        sqlx::query(
            "INSERT INTO secure_value (namespace, name, title, keeper, external_id, version, labels, \
                                       created_at, created_by, updated_at, updated_by) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(&request.namespace)
        .bind(&request.name)
        .bind(&request.title)
        .bind(&keeper_name)
        .bind(external_id.as_str())
        .bind(&labels)
        .bind(now)
        .bind(&identity.uid)
        .bind(now)
        .bind(&identity.uid)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                KeepsakeError::conflict(
                    format!(
                        "Secure value '{}' already exists in namespace '{}'",
                        request.name, request.namespace
                    ),
                    "secure_value",
                )
            } else {
                KeepsakeError::Database {
                    source: e,
                    context: format!("Failed to create secure value '{}'", request.name),
                }
            }
        })?;

        self.outbox
            .append(
                &mut *tx,
                AppendOutboxMessage {
                    message_type: OutboxMessageType::SecureValueCreate,
                    namespace: request.namespace.clone(),
                    name: request.name.clone(),
                    payload: serde_json::json!({
                        "keeper": keeper_name.as_str(),
                        "external_id": external_id.as_str(),
                    }),
                },
            )
            .await?;

        tx.commit().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to commit create for '{}'", request.name),
        })?;

        tracing::info!(
            namespace = %request.namespace,
            name = %request.name,
            keeper = %keeper_name,
            "Created secure value"
        );

        Ok(SecureValueData {
            namespace: request.namespace,
            name: request.name,
            title: request.title,
            keeper: keeper_name,
            external_id: external_id.as_str().to_string(),
            version: 1,
            labels: request.labels,
            value: None,
            created_at: now,
            created_by: identity.uid.clone(),
            updated_at: now,
            updated_by: identity.uid.clone(),
        })
    }

    /// Read secure value metadata. Never returns plaintext.
    #[instrument(skip(self, ctx), fields(namespace = %namespace, name = %name), name = "secure_value_read")]
    pub async fn read(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<SecureValueData> {
        ctx.require_auth()?;

        self.fetch_row(namespace, name)
            .await?
            .ok_or_else(|| KeepsakeError::not_found("secure_value", name))?
            .into_data()
    }

    /// Update an existing secure value. A new plaintext replaces the
    /// keeper-held value in place, reusing the stored external id.
    #[instrument(skip(self, ctx, request), fields(namespace = %request.namespace, name = %request.name), name = "secure_value_update")]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        request: UpdateSecureValueRequest,
    ) -> Result<SecureValueData> {
        let identity = ctx.require_auth()?;

        let current = self
            .fetch_row(&request.namespace, &request.name)
            .await?
            .ok_or_else(|| KeepsakeError::not_found("secure_value", request.name.clone()))?;

        if let Some(value) = request.value {
            let (keeper_type, keeper_config) =
                self.keeper_metadata.resolve(&request.namespace, &current.keeper).await?;
            let keeper = self.keepers.get(keeper_type)?;
            let external_id =
                crate::secrets::keeper::ExternalId::from_string(current.external_id.clone());
            keeper.update(&keeper_config, &request.namespace, &external_id, value).await?;
        }

        let new_title = request.title.unwrap_or(current.title);
        let new_labels = match request.labels {
            Some(labels) => serde_json::to_string(&labels).map_err(|e| {
                KeepsakeError::Serialization {
                    source: e,
                    context: format!("Failed to encode labels for '{}'", request.name),
                }
            })?,
            None => current.labels,
        };
        let new_version = current.version + 1;
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to begin update transaction for '{}'", request.name),
        })?;

        sqlx::query(
            "UPDATE secure_value SET title = ?, labels = ?, version = ?, updated_at = ?, updated_by = ? \
             WHERE namespace = ? AND name = ?",
        )
        .bind(&new_title)
        .bind(&new_labels)
        .bind(new_version)
        .bind(now)
        .bind(&identity.uid)
        .bind(&request.namespace)
        .bind(&request.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to update secure value '{}'", request.name),
        })?;

        self.outbox
            .append(
                &mut *tx,
                AppendOutboxMessage {
                    message_type: OutboxMessageType::SecureValueUpdate,
                    namespace: request.namespace.clone(),
                    name: request.name.clone(),
                    payload: serde_json::json!({
                        "keeper": current.keeper,
                        "version": new_version,
                    }),
                },
            )
            .await?;

        tx.commit().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to commit update for '{}'", request.name),
        })?;

        tracing::info!(
            namespace = %request.namespace,
            name = %request.name,
            version = new_version,
            "Updated secure value"
        );

        self.read(ctx, &request.namespace, &request.name).await
    }

    /// Delete a secure value.
    ///
    /// The keeper-held plaintext is deleted before the metadata row, so a
    /// crash between the two leaves an orphaned ciphertext (reclaimed
    /// out-of-band) rather than a metadata row pointing at nothing.
    #[instrument(skip(self, ctx), fields(namespace = %namespace, name = %name), name = "secure_value_delete")]
    pub async fn delete(&self, ctx: &RequestContext, namespace: &str, name: &str) -> Result<()> {
        ctx.require_auth()?;

        let current = self
            .fetch_row(namespace, name)
            .await?
            .ok_or_else(|| KeepsakeError::not_found("secure_value", name))?;

        let (keeper_type, keeper_config) =
            self.keeper_metadata.resolve(namespace, &current.keeper).await?;
        let keeper = self.keepers.get(keeper_type)?;
        let external_id =
            crate::secrets::keeper::ExternalId::from_string(current.external_id.clone());
        keeper.delete(&keeper_config, namespace, &external_id).await?;

        let mut tx = self.pool.begin().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to begin delete transaction for '{}'", name),
        })?;

        sqlx::query("DELETE FROM secure_value WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: format!("Failed to delete secure value '{}'", name),
            })?;

        self.outbox
            .append(
                &mut *tx,
                AppendOutboxMessage {
                    message_type: OutboxMessageType::SecureValueDelete,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    payload: serde_json::json!({
                        "keeper": current.keeper,
                        "external_id": current.external_id,
                    }),
                },
            )
            .await?;

        tx.commit().await.map_err(|e| KeepsakeError::Database {
            source: e,
            context: format!("Failed to commit delete for '{}'", name),
        })?;

        tracing::info!(namespace = %namespace, name = %name, "Deleted secure value");

        Ok(())
    }

    /// List secure values in a namespace, filtered client-side by the label
    /// selector. No selector means "select all".
    #[instrument(skip(self, ctx, selector), fields(namespace = %namespace), name = "secure_value_list")]
    pub async fn list(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<SecureValueData>> {
        ctx.require_auth()?;

        let sql = format!(
            "SELECT {} FROM secure_value WHERE namespace = ? ORDER BY name",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Sqlite, SecureValueRow>(&sql)
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KeepsakeError::Database {
                source: e,
                context: format!("Failed to list secure values in namespace '{}'", namespace),
            })?;

        let everything = LabelSelector::everything();
        let selector = selector.unwrap_or(&everything);

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let data = row.into_data()?;
            if selector.matches(&data.labels) {
                values.push(data);
            }
        }

        Ok(values)
    }
}
