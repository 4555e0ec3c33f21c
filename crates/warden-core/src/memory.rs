//! In-memory [`ClusterApi`] backend
//!
//! Mimics the platform behaviours the reconcilers depend on: optimistic
//! concurrency on `resourceVersion`, finalizer-gated deletion and a status
//! subresource that plain updates cannot touch.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cluster::{ClusterApi, ClusterError, ClusterResult, ResourceKind};

type StoreKey = (ResourceKind, String, String);

#[derive(Default)]
pub struct MemoryCluster {
    objects: RwLock<BTreeMap<StoreKey, Value>>,
    version: AtomicU64,
    failing: RwLock<HashSet<ResourceKind>>,
    deleted: RwLock<Vec<(ResourceKind, String, String)>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call touching `kind` fails with a transport error until cleared.
    pub fn fail_kind(&self, kind: ResourceKind, failing: bool) {
        let mut set = self.failing.write();
        if failing {
            set.insert(kind);
        } else {
            set.remove(&kind);
        }
    }

    /// Objects actually removed from the store, in order.
    pub fn deleted(&self) -> Vec<(ResourceKind, String, String)> {
        self.deleted.read().clone()
    }

    pub fn contains(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        self.objects
            .read()
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    /// Insert without going through create, e.g. to seed pods.
    pub fn seed(&self, kind: ResourceKind, namespace: &str, object: Value) {
        let name = object_name(&object);
        let object = self.stamp(object, namespace);
        self.objects
            .write()
            .insert((kind, namespace.to_string(), name), object);
    }

    fn check(&self, kind: ResourceKind) -> ClusterResult<()> {
        if self.failing.read().contains(&kind) {
            return Err(ClusterError::Transport(format!(
                "injected failure for {}",
                kind
            )));
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, mut object: Value, namespace: &str) -> Value {
        let version = self.next_version();
        if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".into(), json!(namespace));
            meta.insert("resourceVersion".into(), json!(version));
            meta.entry("uid").or_insert_with(|| json!(Uuid::new_v4().to_string()));
        }
        object
    }
}

fn object_name(object: &Value) -> String {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn resource_version(object: &Value) -> Option<&str> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

fn has_finalizers(object: &Value) -> bool {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(object: &Value) -> bool {
    object.pointer("/metadata/deletionTimestamp").is_some()
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<Value> {
        self.check(kind)?;
        self.objects
            .read()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::not_found(kind, namespace, name))
    }

    async fn list(&self, kind: ResourceKind, namespace: &str) -> ClusterResult<Vec<Value>> {
        self.check(kind)?;
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        self.check(kind)?;
        let name = object_name(&object);
        let key = (kind, namespace.to_string(), name.clone());
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(ClusterError::Conflict {
                kind: kind.to_string(),
                name,
                message: "already exists".into(),
            });
        }
        let object = self.stamp(object, namespace);
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        namespace: &str,
        mut object: Value,
    ) -> ClusterResult<Value> {
        self.check(kind)?;
        let name = object_name(&object);
        let key = (kind, namespace.to_string(), name.clone());
        let mut objects = self.objects.write();
        let stored = objects
            .get(&key)
            .ok_or_else(|| ClusterError::not_found(kind, namespace, &name))?;

        if let Some(version) = resource_version(&object) {
            if Some(version) != resource_version(stored) {
                return Err(ClusterError::Conflict {
                    kind: kind.to_string(),
                    name,
                    message: "resource version changed".into(),
                });
            }
        }

        if kind.has_status_subresource() {
            match stored.get("status") {
                Some(status) => {
                    object["status"] = status.clone();
                }
                None => {
                    if let Some(map) = object.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
        }
        if let Some(ts) = stored.pointer("/metadata/deletionTimestamp").cloned() {
            object["metadata"]["deletionTimestamp"] = ts;
        }

        if is_deleting(&object) && !has_finalizers(&object) {
            objects.remove(&key);
            self.deleted.write().push(key);
            return Ok(object);
        }

        let object = self.stamp(object, namespace);
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        self.check(kind)?;
        let name = object_name(&object);
        let key = (kind, namespace.to_string(), name.clone());
        let mut objects = self.objects.write();
        let mut stored = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(kind, namespace, &name))?;
        stored["status"] = object.get("status").cloned().unwrap_or_else(|| json!({}));
        let stored = self.stamp(stored, namespace);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()> {
        self.check(kind)?;
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.write();
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| ClusterError::not_found(kind, namespace, name))?;

        if has_finalizers(stored) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            stored["metadata"]["deletionTimestamp"] = json!(now.to_string());
            return Ok(());
        }

        objects.remove(&key);
        self.deleted.write().push(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TypedApi;
    use crate::resources::{Pod, ObjectMeta, Resource};

    fn pod(name: &str) -> Value {
        json!({"metadata": {"name": name}, "spec": {}})
    }

    #[tokio::test]
    async fn test_create_get_and_conflict() {
        let cluster = MemoryCluster::new();
        cluster.create(ResourceKind::Pod, "db", pod("p")).await.unwrap();
        let got = cluster.get(ResourceKind::Pod, "db", "p").await.unwrap();
        assert_eq!(got["metadata"]["namespace"], "db");

        let err = cluster.create(ResourceKind::Pod, "db", pod("p")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));

        let err = cluster.get(ResourceKind::Pod, "other", "p").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let cluster = MemoryCluster::new();
        let first = cluster.create(ResourceKind::Pod, "db", pod("p")).await.unwrap();
        cluster.update(ResourceKind::Pod, "db", first.clone()).await.unwrap();
        let err = cluster.update(ResourceKind::Pod, "db", first).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_finalizer_gates_deletion() {
        let cluster = MemoryCluster::new();
        let mut meta = ObjectMeta::named("db", "p");
        meta.finalizers.push("x".into());
        let p = Pod::new(meta);
        cluster
            .create(ResourceKind::Pod, "db", serde_json::to_value(&p).unwrap())
            .await
            .unwrap();

        cluster.delete(ResourceKind::Pod, "db", "p").await.unwrap();
        let mut pending: Pod = cluster.get_typed("db", "p").await.unwrap();
        assert!(pending.metadata().is_deleting());

        pending.metadata_mut().remove_finalizer("x");
        cluster.update_typed(&pending).await.unwrap();
        assert!(!cluster.contains(ResourceKind::Pod, "db", "p"));
        assert_eq!(cluster.deleted().len(), 1);
    }

    #[tokio::test]
    async fn test_status_subresource_is_separate() {
        let cluster = MemoryCluster::new();
        let obj = json!({"metadata": {"name": "s"}, "spec": {"replicas": 1}});
        let created = cluster
            .create(ResourceKind::ReplicatedSet, "db", obj)
            .await
            .unwrap();

        let mut with_status = created.clone();
        with_status["status"] = json!({"primary": "a"});
        let after = cluster
            .update_status(ResourceKind::ReplicatedSet, "db", with_status)
            .await
            .unwrap();
        assert_eq!(after["status"]["primary"], "a");

        let mut spec_change = after.clone();
        spec_change["status"] = json!({"primary": "b"});
        let after = cluster
            .update(ResourceKind::ReplicatedSet, "db", spec_change)
            .await
            .unwrap();
        assert_eq!(after["status"]["primary"], "a");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let cluster = MemoryCluster::new();
        cluster.fail_kind(ResourceKind::Service, true);
        let err = cluster.list(ResourceKind::Service, "").await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
        cluster.fail_kind(ResourceKind::Service, false);
        assert!(cluster.list(ResourceKind::Service, "").await.unwrap().is_empty());
    }
}
