//! Custom resources and the handful of platform objects the reconcilers touch

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cluster::ResourceKind;
use crate::config_text::ConfigFiles;
use crate::wire::Endpoint;

pub const API_GROUP: &str = "redis.warden.io";
pub const API_VERSION: &str = "redis.warden.io/v1";

pub const REPLICATED_SET_FINALIZER: &str = "redis.warden.io/replicatedset-finalizer";
pub const SENTINEL_SET_FINALIZER: &str = "redis.warden.io/sentinelset-finalizer";

/// Set by the platform on every pod of a stateful workload.
pub const POD_INDEX_LABEL: &str = "apps.kubernetes.io/pod-index";
pub const ROLE_LABEL: &str = "redis.warden.io/role";
pub const PRIMARY_LABEL: &str = "redis.warden.io/primary";

pub const REDIS_CONF: &str = "redis.conf";
pub const SENTINEL_CONF: &str = "sentinel.conf";

const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_SENTINEL_PORT: u16 = 26379;
const MAX_LABEL_LEN: usize = 63;

/// Namespace + name identity of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Fields we do not model, kept so updates round-trip them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ObjectMeta {
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn pod_index(&self) -> Option<usize> {
        self.labels.get(POD_INDEX_LABEL)?.parse().ok()
    }

    /// Owner reference pointing at this object, for dependents.
    pub fn owner_reference(&self, kind: &str) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: kind.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone().unwrap_or_default(),
            controller: true,
        }
    }
}

/// Typed view over an object stored behind the cluster API.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecretRef {
    /// Volume name the secret is mounted under
    pub name: String,
    pub secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelBinding {
    pub sentinel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downtime_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSetSpec {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel: Option<SentinelBinding>,
    #[serde(default)]
    pub config: ConfigFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Default for ReplicatedSetSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            tls: None,
            sentinel: None,
            config: ConfigFiles::default(),
            image: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
}

/// A primary with N secondaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSet {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "replicated_set_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReplicatedSetSpec,
    #[serde(default)]
    pub status: ReplicatedSetStatus,
}

impl ReplicatedSet {
    pub fn new(namespace: &str, name: &str, spec: ReplicatedSetSpec) -> Self {
        Self {
            api_version: api_version(),
            kind: replicated_set_kind(),
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: ReplicatedSetStatus::default(),
        }
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.metadata.name)
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.metadata.name)
    }

    pub fn config_name(&self) -> String {
        format!("{}-config", self.metadata.name)
    }

    /// `tls-port` when TLS is configured, `port` otherwise, then 6379.
    pub fn port(&self) -> u16 {
        let directive = if self.spec.tls.is_some() { "tls-port" } else { "port" };
        self.spec
            .config
            .value(REDIS_CONF, directive)
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_REDIS_PORT)
    }

    pub fn password(&self) -> Option<String> {
        self.spec.config.value(REDIS_CONF, "requirepass")
    }

    pub fn member_endpoints(&self) -> Vec<Endpoint> {
        member_endpoints(&self.metadata, &self.headless_service_name(), self.spec.replicas, self.port())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        workload_labels(&self.metadata.name, "replicatedset")
    }
}

impl Resource for ReplicatedSet {
    const KIND: ResourceKind = ResourceKind::ReplicatedSet;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSetSpec {
    #[serde(default = "default_quorum")]
    pub quorum: u32,
    /// Name the Sentinels use for the monitored set
    pub master_name: String,
    pub replicated_set_name: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub config: ConfigFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Sentinel fleet watching one replicated set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSet {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "sentinel_set_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: SentinelSetSpec,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub status: serde_json::Map<String, serde_json::Value>,
}

impl SentinelSet {
    pub fn new(namespace: &str, name: &str, spec: SentinelSetSpec) -> Self {
        Self {
            api_version: api_version(),
            kind: sentinel_set_kind(),
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: serde_json::Map::new(),
        }
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.metadata.name)
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.metadata.name)
    }

    pub fn config_name(&self) -> String {
        format!("{}-conf", self.metadata.name)
    }

    pub fn quorum(&self) -> u32 {
        self.spec.quorum.max(1)
    }

    pub fn port(&self) -> u16 {
        ["tls-port", "port"]
            .iter()
            .find_map(|d| self.spec.config.value(SENTINEL_CONF, d))
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_SENTINEL_PORT)
    }

    pub fn password(&self) -> Option<String> {
        self.spec.config.value(SENTINEL_CONF, "requirepass")
    }

    pub fn member_endpoints(&self) -> Vec<Endpoint> {
        member_endpoints(&self.metadata, &self.headless_service_name(), self.spec.replicas, self.port())
    }

    pub fn pod_name(&self, ordinal: usize) -> String {
        format!("{}-{}", self.metadata.name, ordinal)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        workload_labels(&self.metadata.name, "sentinelset")
    }
}

impl Resource for SentinelSet {
    const KIND: ResourceKind = ResourceKind::SentinelSet;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl Pod {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            rest: serde_json::Map::new(),
        }
    }
}

impl Resource for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Secret with base64-encoded values, as the platform stores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl Resource for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Clamp to the 63 character limit and strip trailing characters labels
/// may not end with.
pub fn label_value(value: &str) -> String {
    let truncated: String = value.chars().take(MAX_LABEL_LEN).collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn member_endpoints(meta: &ObjectMeta, headless: &str, replicas: u32, port: u16) -> Vec<Endpoint> {
    (0..replicas as usize)
        .map(|ordinal| Endpoint {
            host: format!(
                "{}-{}.{}.{}.svc.cluster.local",
                meta.name, ordinal, headless, meta.namespace
            ),
            port,
            ordinal,
        })
        .collect()
}

fn workload_labels(name: &str, part_of: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), format!("{}-service", name)),
        ("app.kubernetes.io/instance".to_string(), "redis".to_string()),
        ("app.kubernetes.io/component".to_string(), "redis-database".to_string()),
        ("app.kubernetes.io/part-of".to_string(), part_of.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "redis-warden".to_string()),
    ])
}

fn default_replicas() -> u32 {
    1
}

fn default_quorum() -> u32 {
    1
}

fn api_version() -> String {
    API_VERSION.to_string()
}

fn replicated_set_kind() -> String {
    "ReplicatedSet".to_string()
}

fn sentinel_set_kind() -> String {
    "SentinelSet".to_string()
}
