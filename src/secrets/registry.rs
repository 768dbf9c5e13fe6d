//! Keeper registry
//!
//! Closed-variant dispatch table from `KeeperType` to keeper instances.
//! Extensible only through explicit registration; resolving an unregistered
//! type is a NotFound error, never a fallback.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::errors::{KeepsakeError, Result};
use crate::secrets::encryption::SecretEncryption;
use crate::secrets::keeper::{Keeper, KeeperType};
use crate::secrets::sql::SqlKeeper;
use crate::storage::DbPool;

/// Registry of keeper instances keyed by type.
pub struct KeeperRegistry {
    keepers: HashMap<KeeperType, Arc<dyn Keeper>>,
}

impl std::fmt::Debug for KeeperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperRegistry")
            .field("keepers", &self.keepers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeeperRegistry {
    /// Create a new registry with no keepers
    pub fn new() -> Self {
        Self { keepers: HashMap::new() }
    }

    /// Create a registry with the built-in SQL keeper already registered.
    /// The SQL keeper must always be present: the reserved default keeper
    /// name resolves to it without a config lookup.
    pub fn with_sql_keeper(pool: DbPool, encryption: SecretEncryption) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqlKeeper::new(pool, encryption)));
        registry
    }

    /// Register a keeper instance
    pub fn register(&mut self, keeper: Arc<dyn Keeper>) {
        let keeper_type = keeper.keeper_type();
        info!(keeper_type = %keeper_type, "Registering keeper");
        self.keepers.insert(keeper_type, keeper);
    }

    /// Resolve a keeper by type
    pub fn get(&self, keeper_type: KeeperType) -> Result<Arc<dyn Keeper>> {
        self.keepers
            .get(&keeper_type)
            .cloned()
            .ok_or_else(|| KeepsakeError::not_found("keeper", keeper_type.as_str()))
    }

    /// Check if a keeper type is registered
    pub fn has_keeper(&self, keeper_type: KeeperType) -> bool {
        self.keepers.contains_key(&keeper_type)
    }

    /// Get list of registered keeper types
    pub fn registered_keepers(&self) -> Vec<KeeperType> {
        self.keepers.keys().copied().collect()
    }
}

impl Default for KeeperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for KeeperRegistry {
    fn clone(&self) -> Self {
        Self { keepers: self.keepers.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::memory::MemoryKeeper;

    #[test]
    fn test_empty_registry() {
        let registry = KeeperRegistry::new();
        assert!(registry.registered_keepers().is_empty());
        assert!(!registry.has_keeper(KeeperType::Sql));
    }

    #[test]
    fn test_unregistered_keeper_is_not_found() {
        let registry = KeeperRegistry::new();
        let err = registry.get(KeeperType::Vault).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = KeeperRegistry::new();
        registry.register(Arc::new(MemoryKeeper::new()));

        assert!(registry.has_keeper(KeeperType::Sql));
        let keeper = registry.get(KeeperType::Sql).unwrap();
        assert_eq!(keeper.keeper_type(), KeeperType::Sql);
    }

    #[test]
    fn test_register_under_alternate_type() {
        let mut registry = KeeperRegistry::new();
        registry.register(Arc::new(MemoryKeeper::with_type(KeeperType::Vault)));

        assert!(registry.has_keeper(KeeperType::Vault));
        assert!(!registry.has_keeper(KeeperType::Sql));
    }

    #[test]
    fn test_registry_debug_lists_types() {
        let mut registry = KeeperRegistry::new();
        registry.register(Arc::new(MemoryKeeper::new()));
        let debug = format!("{:?}", registry);
        assert!(debug.contains("Sql"));
    }
}
