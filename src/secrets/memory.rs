//! In-memory keeper
//!
//! Holds plaintext in process memory with no persistence. Intended for tests
//! and local development only; selected the same way any other keeper is,
//! through explicit registration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{KeepsakeError, Result};
use crate::secrets::keeper::{ExternalId, Keeper, KeeperConfig, KeeperType};
use crate::secrets::types::SecretString;

/// Keeper storing values in a process-local map keyed by
/// `(namespace, external_id)`.
pub struct MemoryKeeper {
    values: Mutex<HashMap<(String, String), SecretString>>,
    /// Keeper type to report; lets tests stand a memory keeper in for an
    /// external keeper type.
    reported_type: KeeperType,
}

impl MemoryKeeper {
    pub fn new() -> Self {
        Self { values: Mutex::new(HashMap::new()), reported_type: KeeperType::Sql }
    }

    /// A memory keeper that registers under the given keeper type.
    pub fn with_type(reported_type: KeeperType) -> Self {
        Self { values: Mutex::new(HashMap::new()), reported_type }
    }

    /// Number of values currently held.
    pub fn len(&self) -> usize {
        self.values.lock().expect("memory keeper lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeeper")
            .field("reported_type", &self.reported_type)
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Default for MemoryKeeper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Keeper for MemoryKeeper {
    async fn store(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        value: SecretString,
    ) -> Result<ExternalId> {
        let external_id = ExternalId::new();
        self.values
            .lock()
            .expect("memory keeper lock poisoned")
            .insert((namespace.to_string(), external_id.as_str().to_string()), value);
        Ok(external_id)
    }

    async fn update(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
        value: SecretString,
    ) -> Result<()> {
        let mut values = self.values.lock().expect("memory keeper lock poisoned");
        let key = (namespace.to_string(), external_id.as_str().to_string());
        if !values.contains_key(&key) {
            return Err(KeepsakeError::not_found("secret_value", external_id.as_str()));
        }
        values.insert(key, value);
        Ok(())
    }

    async fn expose(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
    ) -> Result<SecretString> {
        self.values
            .lock()
            .expect("memory keeper lock poisoned")
            .get(&(namespace.to_string(), external_id.as_str().to_string()))
            .cloned()
            .ok_or_else(|| KeepsakeError::not_found("secret_value", external_id.as_str()))
    }

    async fn delete(
        &self,
        _config: &KeeperConfig,
        namespace: &str,
        external_id: &ExternalId,
    ) -> Result<()> {
        self.values
            .lock()
            .expect("memory keeper lock poisoned")
            .remove(&(namespace.to_string(), external_id.as_str().to_string()));
        Ok(())
    }

    fn keeper_type(&self) -> KeeperType {
        self.reported_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_keeper_roundtrip() {
        let keeper = MemoryKeeper::new();
        let id = keeper
            .store(&KeeperConfig::Sql, "ns", SecretString::new("value"))
            .await
            .unwrap();

        let exposed = keeper.expose(&KeeperConfig::Sql, "ns", &id).await.unwrap();
        assert_eq!(exposed.expose_secret(), "value");

        keeper.delete(&KeeperConfig::Sql, "ns", &id).await.unwrap();
        assert!(keeper.expose(&KeeperConfig::Sql, "ns", &id).await.is_err());
        assert!(keeper.is_empty());
    }

    #[tokio::test]
    async fn test_memory_keeper_update_requires_existing() {
        let keeper = MemoryKeeper::new();
        let err = keeper
            .update(&KeeperConfig::Sql, "ns", &ExternalId::new(), SecretString::new("v"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_memory_keeper_debug_redacts() {
        let keeper = MemoryKeeper::new();
        let debug = format!("{:?}", keeper);
        assert!(debug.contains("[REDACTED]"));
    }
}
