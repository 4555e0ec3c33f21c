//! Dependent resource documents
//!
//! Just enough of a headless service, client service, config map and
//! stateful workload to run a set. Documents are plain JSON and are upserted
//! through [`crate::cluster::TypedApi::upsert`].

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::resources::{OwnerReference, ReplicatedSet, SentinelSet, REDIS_CONF, SENTINEL_CONF};

const DEFAULT_IMAGE: &str = "redis:7.2";
const CONFIG_MOUNT: &str = "/etc/redis";
const CONFIG_SOURCE_MOUNT: &str = "/etc/redis-src";
const INIT_IMAGE: &str = "busybox";

/// Everything the builders need to know about a set.
#[derive(Debug, Clone)]
pub struct WorkloadShape {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub owner: OwnerReference,
    pub replicas: u32,
    pub port: u16,
    pub headless_service: String,
    pub client_service: String,
    pub config_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub tls_secret: Option<String>,
    /// Config file the process rewrites at runtime. It is copied out of the
    /// read-only config map into a pod-local volume before start.
    pub writable_config: Option<String>,
}

impl WorkloadShape {
    pub fn for_replicated(set: &ReplicatedSet) -> Self {
        Self {
            name: set.metadata.name.clone(),
            namespace: set.metadata.namespace.clone(),
            labels: set.labels(),
            owner: set.metadata.owner_reference(&set.kind),
            replicas: set.spec.replicas,
            port: set.port(),
            headless_service: set.headless_service_name(),
            client_service: set.service_name(),
            config_name: set.config_name(),
            image: set.spec.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            command: vec![
                "redis-server".to_string(),
                format!("{}/{}", CONFIG_MOUNT, REDIS_CONF),
            ],
            tls_secret: set.spec.tls.as_ref().map(|t| t.secret_name.clone()),
            writable_config: None,
        }
    }

    /// `tls_secret` is the bound replicated set's, if any.
    pub fn for_sentinel(set: &SentinelSet, tls_secret: Option<String>) -> Self {
        Self {
            name: set.metadata.name.clone(),
            namespace: set.metadata.namespace.clone(),
            labels: set.labels(),
            owner: set.metadata.owner_reference(&set.kind),
            replicas: set.spec.replicas,
            port: set.port(),
            headless_service: set.headless_service_name(),
            client_service: set.service_name(),
            config_name: set.config_name(),
            image: set.spec.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            command: vec![
                "redis-sentinel".to_string(),
                format!("{}/{}", CONFIG_MOUNT, SENTINEL_CONF),
            ],
            tls_secret,
            writable_config: Some(SENTINEL_CONF.to_string()),
        }
    }

    fn metadata(&self, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.namespace,
            "labels": self.labels,
            "ownerReferences": [self.owner],
        })
    }

    fn ports(&self) -> Value {
        json!([{"name": "redis", "port": self.port, "targetPort": self.port, "protocol": "TCP"}])
    }
}

/// Headless service giving each member its stable DNS name.
pub fn headless_service(shape: &WorkloadShape) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": shape.metadata(&shape.headless_service),
        "spec": {
            "clusterIP": "None",
            "publishNotReadyAddresses": true,
            "selector": shape.labels,
            "ports": shape.ports(),
        }
    })
}

pub fn client_service(shape: &WorkloadShape) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": shape.metadata(&shape.client_service),
        "spec": {
            "type": "ClusterIP",
            "selector": shape.labels,
            "ports": shape.ports(),
        }
    })
}

pub fn config_map(shape: &WorkloadShape, data: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": shape.metadata(&shape.config_name),
        "data": data,
    })
}

pub fn workload_set(shape: &WorkloadShape) -> Value {
    let mut volumes = vec![json!({"name": "config", "configMap": {"name": shape.config_name}})];
    let mut mounts = Vec::new();
    let mut init_containers = Vec::new();
    match &shape.writable_config {
        Some(file) => {
            volumes.push(json!({"name": "config-rw", "emptyDir": {}}));
            mounts.push(json!({"name": "config-rw", "mountPath": CONFIG_MOUNT}));
            init_containers.push(json!({
                "name": format!("{}-init", shape.name),
                "image": INIT_IMAGE,
                "imagePullPolicy": "IfNotPresent",
                "command": [
                    "/bin/sh",
                    "-c",
                    format!("cp {}/{} {}/{}", CONFIG_SOURCE_MOUNT, file, CONFIG_MOUNT, file),
                ],
                "volumeMounts": [
                    {"name": "config", "mountPath": CONFIG_SOURCE_MOUNT, "readOnly": true},
                    {"name": "config-rw", "mountPath": CONFIG_MOUNT},
                ],
            }));
        }
        None => mounts.push(json!({"name": "config", "mountPath": CONFIG_MOUNT})),
    }
    if let Some(secret) = &shape.tls_secret {
        volumes.push(json!({"name": "tls", "secret": {"secretName": secret}}));
        mounts.push(json!({"name": "tls", "mountPath": "/etc/redis/tls", "readOnly": true}));
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": shape.metadata(&shape.name),
        "spec": {
            "replicas": shape.replicas,
            "serviceName": shape.headless_service,
            "podManagementPolicy": "Parallel",
            "selector": {"matchLabels": shape.labels},
            "template": {
                "metadata": {"labels": shape.labels},
                "spec": {
                    "initContainers": init_containers,
                    "containers": [{
                        "name": shape.name,
                        "image": shape.image,
                        "imagePullPolicy": "IfNotPresent",
                        "command": shape.command,
                        "ports": [{"name": "redis", "containerPort": shape.port, "protocol": "TCP"}],
                        "volumeMounts": mounts,
                    }],
                    "volumes": volumes,
                }
            }
        }
    })
}
