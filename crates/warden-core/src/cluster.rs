//! Cluster API seam
//!
//! The reconcilers only need get/list/create/update/delete over a small set
//! of resource kinds, with "not found" distinguishable from every other
//! failure. [`ClusterApi`] is that contract over raw JSON documents so it
//! stays object safe; [`TypedApi`] layers serde conversion on top.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::resources::Resource;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ReplicatedSet,
    SentinelSet,
    WorkloadSet,
    Service,
    ConfigMap,
    Secret,
    Pod,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ReplicatedSet => "ReplicatedSet",
            ResourceKind::SentinelSet => "SentinelSet",
            ResourceKind::WorkloadSet => "StatefulSet",
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Pod => "Pod",
        }
    }

    /// Kinds served through a status subresource.
    pub fn has_status_subresource(&self) -> bool {
        matches!(
            self,
            ResourceKind::ReplicatedSet | ResourceKind::SentinelSet | ResourceKind::WorkloadSet
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        ClusterError::NotFound {
            kind: kind.as_str().to_string(),
            name: format!("{}/{}", namespace, name),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Raw access to cluster objects. An empty namespace on `list` means all
/// namespaces.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<Value>;

    async fn list(&self, kind: ResourceKind, namespace: &str) -> ClusterResult<Vec<Value>>;

    async fn create(&self, kind: ResourceKind, namespace: &str, object: Value)
        -> ClusterResult<Value>;

    async fn update(&self, kind: ResourceKind, namespace: &str, object: Value)
        -> ClusterResult<Value>;

    async fn update_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()>;
}

/// Serde conversions and upsert on top of any [`ClusterApi`].
#[async_trait]
pub trait TypedApi {
    async fn get_typed<R: Resource>(&self, namespace: &str, name: &str) -> ClusterResult<R>;

    async fn list_typed<R: Resource>(&self, namespace: &str) -> ClusterResult<Vec<R>>;

    async fn update_typed<R: Resource>(&self, object: &R) -> ClusterResult<R>;

    async fn update_status_typed<R: Resource>(&self, object: &R) -> ClusterResult<R>;

    /// Create the object, or replace the stored copy when it exists. Only
    /// server-owned fields of the stored copy are kept.
    async fn upsert(&self, kind: ResourceKind, namespace: &str, desired: Value)
        -> ClusterResult<Value>;
}

#[async_trait]
impl<T: ClusterApi + ?Sized> TypedApi for T {
    async fn get_typed<R: Resource>(&self, namespace: &str, name: &str) -> ClusterResult<R> {
        let raw = self.get(R::KIND, namespace, name).await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn list_typed<R: Resource>(&self, namespace: &str) -> ClusterResult<Vec<R>> {
        self.list(R::KIND, namespace)
            .await?
            .into_iter()
            .map(|raw| serde_json::from_value(raw).map_err(ClusterError::from))
            .collect()
    }

    async fn update_typed<R: Resource>(&self, object: &R) -> ClusterResult<R> {
        let namespace = object.metadata().namespace.clone();
        let raw = self
            .update(R::KIND, &namespace, serde_json::to_value(object)?)
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn update_status_typed<R: Resource>(&self, object: &R) -> ClusterResult<R> {
        let namespace = object.metadata().namespace.clone();
        let raw = self
            .update_status(R::KIND, &namespace, serde_json::to_value(object)?)
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn upsert(
        &self,
        kind: ResourceKind,
        namespace: &str,
        desired: Value,
    ) -> ClusterResult<Value> {
        let name = desired
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match self.get(kind, namespace, &name).await {
            Ok(existing) => {
                let mut desired = desired;
                keep_server_fields(kind, &existing, &mut desired);
                self.update(kind, namespace, desired).await
            }
            Err(e) if e.is_not_found() => self.create(kind, namespace, desired).await,
            Err(e) => Err(e),
        }
    }
}

/// Fields assigned by the server that a freshly built document never carries.
const SERVER_OWNED: &[&str] = &["/metadata/resourceVersion", "/metadata/uid"];
const SERVICE_OWNED: &[&str] = &["/spec/clusterIP", "/spec/clusterIPs"];

/// Copy server-owned fields from `stored` into `desired`. Everything else in
/// `desired` is taken as is, so keys it leaves out are dropped on update.
pub fn keep_server_fields(kind: ResourceKind, stored: &Value, desired: &mut Value) {
    let service: &[&str] = if kind == ResourceKind::Service {
        SERVICE_OWNED
    } else {
        &[]
    };
    for pointer in SERVER_OWNED.iter().chain(service) {
        let Some(value) = stored.pointer(pointer) else {
            continue;
        };
        let (parent, field) = match pointer.rsplit_once('/') {
            Some(split) => split,
            None => continue,
        };
        if let Some(Value::Object(map)) = desired.pointer_mut(parent) {
            map.insert(field.to_string(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_fields_carried_over() {
        let stored = json!({
            "metadata": {"name": "svc", "resourceVersion": "7", "uid": "u-1", "labels": {"old": "x"}},
            "spec": {"clusterIP": "10.1.2.3", "ports": [{"port": 1}]}
        });
        let mut desired = json!({
            "metadata": {"name": "svc", "labels": {"a": "b"}},
            "spec": {"ports": [{"port": 2}]}
        });
        keep_server_fields(ResourceKind::Service, &stored, &mut desired);

        assert_eq!(desired["metadata"]["resourceVersion"], "7");
        assert_eq!(desired["metadata"]["uid"], "u-1");
        assert_eq!(desired["metadata"]["labels"], json!({"a": "b"}));
        assert_eq!(desired["spec"]["clusterIP"], "10.1.2.3");
        assert_eq!(desired["spec"]["ports"], json!([{"port": 2}]));
    }

    #[test]
    fn test_cluster_ip_only_kept_for_services() {
        let stored = json!({"metadata": {"name": "c"}, "spec": {"clusterIP": "10.1.2.3"}});
        let mut desired = json!({"metadata": {"name": "c"}, "spec": {}});
        keep_server_fields(ResourceKind::WorkloadSet, &stored, &mut desired);
        assert!(desired["spec"].get("clusterIP").is_none());
    }

    #[tokio::test]
    async fn test_upsert_drops_removed_keys() {
        let cluster = crate::memory::MemoryCluster::new();
        let first = json!({
            "metadata": {"name": "cache-config", "labels": {"app": "cache", "tier": "db"}},
            "data": {"redis.conf": "port 6379", "extra.conf": "x"}
        });
        let created = cluster.upsert(ResourceKind::ConfigMap, "db", first).await.unwrap();
        let uid = created["metadata"]["uid"].clone();

        let second = json!({
            "metadata": {"name": "cache-config", "labels": {"app": "cache"}},
            "data": {"redis.conf": "port 6379"}
        });
        cluster.upsert(ResourceKind::ConfigMap, "db", second).await.unwrap();

        let stored = cluster.get(ResourceKind::ConfigMap, "db", "cache-config").await.unwrap();
        assert_eq!(stored["data"], json!({"redis.conf": "port 6379"}));
        assert_eq!(stored["metadata"]["labels"], json!({"app": "cache"}));
        assert_eq!(stored["metadata"]["uid"], uid);
    }

    #[test]
    fn test_not_found_helper() {
        let err = ClusterError::not_found(ResourceKind::Pod, "db", "cache-0");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Pod db/cache-0 not found");
    }
}
