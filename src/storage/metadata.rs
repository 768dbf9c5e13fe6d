//! # Versioned Metadata Store
//!
//! Key-value-backed versioned object store keyed by
//! `(group, resource, namespace, name, uid)`. Every write creates a new
//! version; deletion is a tombstone version, never a physical removal of
//! history. Version UIDs are UUIDv7, so the lexicographically greatest key
//! within a lineage is also the most recently written one.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::errors::{KeepsakeError, Result};
use crate::storage::kv::{prefix_range_end, Kv, ListKeysOptions, SortOrder};

/// Key prefix for all metadata entries. Consumers reading the persisted
/// layout directly must use exactly this segment order and separator.
const PREFIX_META: &str = "/unified/meta";

/// Time-ordered version UID. Strictly monotonic within this process, so the
/// lexicographically greatest key in a lineage is the newest version even
/// when several writes land in the same millisecond.
pub fn new_version_uid() -> Uuid {
    Uuid::now_v7()
}

/// Identifies a logical resource lineage, not a specific version. All fields
/// are required except `name`; an empty name means "any name under the
/// namespace/resource prefix".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Metadata value stored per version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder: String,
    pub deleted: bool,
}

/// A single stored version of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaDataObj {
    pub key: ResourceKey,
    pub uid: Uuid,
    pub value: MetaData,
}

/// Versioned metadata store over an ordered key-value substrate.
#[derive(Clone)]
pub struct MetadataStore {
    kv: Arc<dyn Kv>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish()
    }
}

impl MetadataStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Full storage key for one version:
    /// `/unified/meta/{group}/{resource}/{namespace}/{name}/{uid}`.
    fn object_key(key: &ResourceKey, uid: &Uuid) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            PREFIX_META, key.group, key.resource, key.namespace, key.name, uid
        )
    }

    /// Parse a storage key back into its resource key and version UID. Fails
    /// closed on malformed input rather than partially populating the result.
    fn parse_key(key: &str) -> Result<(ResourceKey, Uuid)> {
        let rest = key
            .strip_prefix(PREFIX_META)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| KeepsakeError::validation(format!("Invalid metadata key: {}", key)))?;

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 5 {
            return Err(KeepsakeError::validation(format!("Invalid metadata key: {}", key)));
        }

        let uid = Uuid::parse_str(parts[4]).map_err(|_| {
            KeepsakeError::validation(format!("Invalid uid in metadata key: {}", parts[4]))
        })?;

        Ok((
            ResourceKey {
                group: parts[0].to_string(),
                resource: parts[1].to_string(),
                namespace: parts[2].to_string(),
                name: parts[3].to_string(),
            },
            uid,
        ))
    }

    /// Scan prefix for a resource key. Namespace, group, and resource are
    /// required; name may be omitted to cover a whole namespace/resource.
    fn key_prefix(key: &ResourceKey) -> Result<String> {
        if key.namespace.is_empty() || key.group.is_empty() || key.resource.is_empty() {
            return Err(KeepsakeError::validation(
                "namespace, group, and resource are required",
            ));
        }
        if key.name.is_empty() {
            return Ok(format!(
                "{}/{}/{}/{}/",
                PREFIX_META, key.group, key.resource, key.namespace
            ));
        }
        Ok(format!(
            "{}/{}/{}/{}/{}/",
            PREFIX_META, key.group, key.resource, key.namespace, key.name
        ))
    }

    /// Fetch one version by composite key.
    #[instrument(skip(self, key), fields(name = %key.name, uid = %uid), name = "metadata_get")]
    pub async fn get(&self, key: &ResourceKey, uid: &Uuid) -> Result<MetaData> {
        let entry = self.kv.get(&Self::object_key(key, uid)).await?;
        serde_json::from_slice(&entry.value).map_err(|e| KeepsakeError::Serialization {
            source: e,
            context: format!("Failed to decode metadata for '{}'", key.name),
        })
    }

    /// Resolve the most recent version of a resource. Requires namespace,
    /// group, resource, and name. Returns NotFound when the lineage is empty
    /// or its most recent version is a tombstone.
    #[instrument(skip(self, key), fields(name = %key.name), name = "metadata_get_latest")]
    pub async fn get_latest(&self, key: &ResourceKey) -> Result<MetaDataObj> {
        if key.namespace.is_empty() {
            return Err(KeepsakeError::validation_field("namespace is required", "namespace"));
        }
        if key.group.is_empty() {
            return Err(KeepsakeError::validation_field("group is required", "group"));
        }
        if key.resource.is_empty() {
            return Err(KeepsakeError::validation_field("resource is required", "resource"));
        }
        if key.name.is_empty() {
            return Err(KeepsakeError::validation_field("name is required", "name"));
        }

        let prefix = Self::key_prefix(key)?;
        let keys = self
            .kv
            .list_keys(ListKeysOptions {
                end_key: prefix_range_end(&prefix),
                start_key: prefix,
                sort: SortOrder::Desc,
                limit: 1,
            })
            .await?;

        let latest_key = keys
            .first()
            .ok_or_else(|| KeepsakeError::not_found("metadata", key.name.clone()))?;

        let entry = self.kv.get(latest_key).await?;
        let meta: MetaData =
            serde_json::from_slice(&entry.value).map_err(|e| KeepsakeError::Serialization {
                source: e,
                context: format!("Failed to decode metadata for '{}'", key.name),
            })?;

        if meta.deleted {
            return Err(KeepsakeError::not_found("metadata", key.name.clone()));
        }

        let (_, uid) = Self::parse_key(latest_key)?;

        Ok(MetaDataObj { key: key.clone(), uid, value: meta })
    }

    /// Enumerate all versions under the key's prefix (name may be omitted to
    /// scan a whole namespace/resource). The stream terminates on the first
    /// error; it is not restartable mid-sequence.
    pub fn list(&self, key: ResourceKey) -> impl Stream<Item = Result<MetaDataObj>> + '_ {
        async_stream::stream! {
            let prefix = match Self::key_prefix(&key) {
                Ok(prefix) => prefix,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let keys = match self
                .kv
                .list_keys(ListKeysOptions {
                    end_key: prefix_range_end(&prefix),
                    start_key: prefix,
                    sort: SortOrder::Asc,
                    limit: 0,
                })
                .await
            {
                Ok(keys) => keys,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            for stored_key in keys {
                let entry = match self.kv.get(&stored_key).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let meta: MetaData = match serde_json::from_slice(&entry.value) {
                    Ok(meta) => meta,
                    Err(e) => {
                        yield Err(KeepsakeError::Serialization {
                            source: e,
                            context: format!("Failed to decode metadata at '{}'", stored_key),
                        });
                        return;
                    }
                };

                let (parsed_key, uid) = match Self::parse_key(&stored_key) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                yield Ok(MetaDataObj { key: parsed_key, uid, value: meta });
            }
        }
    }

    /// Write a new version. An existing UID is never overwritten.
    #[instrument(skip(self, obj), fields(name = %obj.key.name, uid = %obj.uid), name = "metadata_save")]
    pub async fn save(&self, obj: &MetaDataObj) -> Result<()> {
        let value = serde_json::to_vec(&obj.value).map_err(|e| KeepsakeError::Serialization {
            source: e,
            context: format!("Failed to encode metadata for '{}'", obj.key.name),
        })?;
        self.kv.insert(&Self::object_key(&obj.key, &obj.uid), &value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::SqlKv;
    use crate::storage::test_helpers::TestDatabase;
    use tokio_stream::StreamExt;

    fn store(db: &TestDatabase) -> MetadataStore {
        MetadataStore::new(Arc::new(SqlKv::new(db.pool.clone())))
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("apps", "deployments", "ns-1", name)
    }

    fn obj(name: &str, folder: &str, deleted: bool) -> MetaDataObj {
        MetaDataObj {
            key: key(name),
            uid: new_version_uid(),
            value: MetaData {
                namespace: "ns-1".to_string(),
                folder: folder.to_string(),
                deleted,
            },
        }
    }

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        let saved = obj("web", "folder-a", false);
        store.save(&saved).await.unwrap();

        let meta = store.get(&saved.key, &saved.uid).await.unwrap();
        assert_eq!(meta, saved.value);
    }

    #[tokio::test]
    async fn test_get_missing_version_fails() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        let err = store.get(&key("web"), &new_version_uid()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_save_never_overwrites_uid() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        let saved = obj("web", "folder-a", false);
        store.save(&saved).await.unwrap();
        let err = store.save(&saved).await.unwrap_err();
        assert!(matches!(err, KeepsakeError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_get_latest_returns_newest_version() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        store.save(&obj("web", "v1", false)).await.unwrap();
        store.save(&obj("web", "v2", false)).await.unwrap();
        let newest = obj("web", "v3", false);
        store.save(&newest).await.unwrap();

        let latest = store.get_latest(&key("web")).await.unwrap();
        assert_eq!(latest.uid, newest.uid);
        assert_eq!(latest.value.folder, "v3");
    }

    #[tokio::test]
    async fn test_get_latest_tombstone_is_not_found() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        store.save(&obj("web", "v1", false)).await.unwrap();
        store.save(&obj("web", "", true)).await.unwrap();

        let err = store.get_latest(&key("web")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_latest_empty_lineage_is_not_found() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        let err = store.get_latest(&key("missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_latest_requires_all_fields() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        for incomplete in [
            ResourceKey::new("", "deployments", "ns-1", "web"),
            ResourceKey::new("apps", "", "ns-1", "web"),
            ResourceKey::new("apps", "deployments", "", "web"),
            ResourceKey::new("apps", "deployments", "ns-1", ""),
        ] {
            let err = store.get_latest(&incomplete).await.unwrap_err();
            assert!(matches!(err, KeepsakeError::Validation { .. }));
        }
    }

    #[tokio::test]
    async fn test_list_enumerates_versions_in_order() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        let first = obj("web", "v1", false);
        let second = obj("web", "v2", false);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        // another name under the same namespace/resource
        store.save(&obj("api", "v1", false)).await.unwrap();

        let objs: Vec<_> = store
            .list(key("web"))
            .collect::<Vec<Result<MetaDataObj>>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].uid, first.uid);
        assert_eq!(objs[1].uid, second.uid);
    }

    #[tokio::test]
    async fn test_list_whole_resource_without_name() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        store.save(&obj("web", "v1", false)).await.unwrap();
        store.save(&obj("api", "v1", false)).await.unwrap();

        let objs: Vec<_> = store
            .list(ResourceKey::new("apps", "deployments", "ns-1", ""))
            .collect::<Vec<Result<MetaDataObj>>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(objs.len(), 2);
    }

    #[tokio::test]
    async fn test_list_missing_required_fields_yields_error() {
        let db = TestDatabase::new().await;
        let store = store(&db);

        let results: Vec<_> = store
            .list(ResourceKey::new("", "", "", ""))
            .collect::<Vec<Result<MetaDataObj>>>()
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_parse_key_roundtrip() {
        let uid = new_version_uid();
        let original = key("web");
        let encoded = MetadataStore::object_key(&original, &uid);
        assert_eq!(encoded, format!("/unified/meta/apps/deployments/ns-1/web/{}", uid));

        let (parsed, parsed_uid) = MetadataStore::parse_key(&encoded).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed_uid, uid);
    }

    #[test]
    fn test_parse_key_fails_closed() {
        for bad in [
            "/other/prefix/a/b/c/d",
            "/unified/meta/apps/deployments/ns-1",
            "/unified/meta/apps/deployments/ns-1/web/not-a-uuid",
            "/unified/meta/apps/deployments/ns-1/web/extra/segments/here",
            "",
        ] {
            assert!(MetadataStore::parse_key(bad).is_err(), "expected failure for '{}'", bad);
        }
    }
}
