//! Keeper trait and types
//!
//! Defines the capability contract for pluggable secret-encryption backends.
//! A keeper owns the secret plaintext; the metadata store only ever holds the
//! opaque external identifier a keeper hands back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::Result;
use crate::secrets::types::SecretString;

/// Name that always resolves to the built-in SQL keeper without a
/// keeper-metadata lookup.
pub const DEFAULT_SQL_KEEPER: &str = "kp-default-sql";

/// Type of keeper backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeeperType {
    /// Built-in keeper storing encrypted values in the local database
    Sql,
    /// HashiCorp Vault KV v2
    Vault,
    /// AWS Secrets Manager
    AwsSecretsManager,
    /// GCP Secret Manager
    GcpSecretManager,
}

impl KeeperType {
    /// Get the database representation of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Vault => "vault",
            Self::AwsSecretsManager => "aws_secrets_manager",
            Self::GcpSecretManager => "gcp_secret_manager",
        }
    }
}

impl FromStr for KeeperType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sql" => Ok(Self::Sql),
            "vault" => Ok(Self::Vault),
            "aws_secrets_manager" => Ok(Self::AwsSecretsManager),
            "gcp_secret_manager" => Ok(Self::GcpSecretManager),
            _ => Err(format!("Unknown keeper type: {}", s)),
        }
    }
}

impl fmt::Display for KeeperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque handle a keeper returns for a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Generate a fresh external identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an identifier retrieved from storage
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExternalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection settings for a Vault-backed keeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultKeeperConfig {
    pub address: String,
    pub mount_path: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Connection settings for an AWS Secrets Manager keeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwsKeeperConfig {
    pub region: String,
    #[serde(default)]
    pub kms_key_id: Option<String>,
}

/// Connection settings for a GCP Secret Manager keeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcpKeeperConfig {
    pub project_id: String,
}

/// Keeper configuration resolved from a keeper-metadata row (or implicitly
/// for the built-in SQL keeper, which needs none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeeperConfig {
    Sql,
    Vault(VaultKeeperConfig),
    AwsSecretsManager(AwsKeeperConfig),
    GcpSecretManager(GcpKeeperConfig),
}

impl KeeperConfig {
    /// The keeper type this configuration belongs to
    pub fn keeper_type(&self) -> KeeperType {
        match self {
            Self::Sql => KeeperType::Sql,
            Self::Vault(_) => KeeperType::Vault,
            Self::AwsSecretsManager(_) => KeeperType::AwsSecretsManager,
            Self::GcpSecretManager(_) => KeeperType::GcpSecretManager,
        }
    }
}

/// Capability contract for secret-encryption backends.
///
/// Implementations must be Send + Sync for use in async contexts, and must
/// never log or expose plaintext in error messages.
#[async_trait]
pub trait Keeper: Send + Sync + std::fmt::Debug {
    /// Store a secret value, returning the opaque handle for later access.
    async fn store(
        &self,
        config: &KeeperConfig,
        namespace: &str,
        value: SecretString,
    ) -> Result<ExternalId>;

    /// Replace the value behind an existing handle in place.
    async fn update(
        &self,
        config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
        value: SecretString,
    ) -> Result<()>;

    /// Reveal the plaintext behind a handle.
    async fn expose(
        &self,
        config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
    ) -> Result<SecretString>;

    /// Delete the value behind a handle. Deleting an already-absent handle is
    /// not an error, so a retried delete stays safe.
    async fn delete(
        &self,
        config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
    ) -> Result<()>;

    /// Get the keeper type identifier
    fn keeper_type(&self) -> KeeperType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeper_type_roundtrip() {
        for kt in [
            KeeperType::Sql,
            KeeperType::Vault,
            KeeperType::AwsSecretsManager,
            KeeperType::GcpSecretManager,
        ] {
            let s = kt.as_str();
            let parsed: KeeperType = s.parse().unwrap();
            assert_eq!(kt, parsed);
        }
    }

    #[test]
    fn test_keeper_type_display() {
        assert_eq!(KeeperType::Sql.to_string(), "sql");
        assert_eq!(KeeperType::Vault.to_string(), "vault");
        assert_eq!(KeeperType::AwsSecretsManager.to_string(), "aws_secrets_manager");
        assert_eq!(KeeperType::GcpSecretManager.to_string(), "gcp_secret_manager");
    }

    #[test]
    fn test_unknown_keeper_type_fails() {
        assert!("etcd".parse::<KeeperType>().is_err());
    }

    #[test]
    fn test_external_id_unique() {
        assert_ne!(ExternalId::new(), ExternalId::new());
    }

    #[test]
    fn test_keeper_config_type() {
        assert_eq!(KeeperConfig::Sql.keeper_type(), KeeperType::Sql);
        let vault = KeeperConfig::Vault(VaultKeeperConfig {
            address: "https://vault.example.com".to_string(),
            mount_path: "secret".to_string(),
            namespace: None,
        });
        assert_eq!(vault.keeper_type(), KeeperType::Vault);
    }

    #[test]
    fn test_vault_config_deserializes_from_payload() {
        let payload = r#"{"address":"https://vault.example.com","mount_path":"secret"}"#;
        let config: VaultKeeperConfig = serde_json::from_str(payload).unwrap();
        assert_eq!(config.address, "https://vault.example.com");
        assert_eq!(config.namespace, None);
    }
}
