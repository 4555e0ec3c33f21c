//! Cluster API over the Kubernetes REST interface
//!
//! Plain JSON over HTTPS with a bearer token. Paths are derived from the
//! resource kind; 404 maps to `NotFound` and 409 to `Conflict`, every other
//! non-success status is an `Api` error carrying the response body.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;
use warden_core::cluster::{ClusterApi, ClusterError, ClusterResult, ResourceKind};
use warden_core::resources::API_VERSION;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where the API server is and how to authenticate against it.
#[derive(Debug, Clone, Default)]
pub struct KubeConfig {
    pub api_server: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

pub struct KubeHttp {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeHttp {
    /// Explicit settings win; anything missing falls back to the in-cluster
    /// service account and `KUBERNETES_SERVICE_HOST`/`_PORT`.
    pub fn new(config: KubeConfig) -> anyhow::Result<Self> {
        let base_url = match config.api_server {
            Some(url) => url,
            None => in_cluster_url()?,
        };
        let sa = Path::new(SERVICE_ACCOUNT_DIR);

        let token_file = config.token_file.or_else(|| existing(sa.join("token")));
        let token = match token_file {
            Some(path) => Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read token {}", path.display()))?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(Duration::from_secs(10)));
        if let Some(path) = config.ca_file.or_else(|| existing(sa.join("ca.crt"))) {
            let pem = std::fs::read(&path)
                .with_context(|| format!("failed to read CA {}", path.display()))?;
            let ca = reqwest::Certificate::from_pem(&pem).context("invalid CA certificate")?;
            builder = builder.add_root_certificate(ca);
        }
        let client = builder.build().context("failed to build http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<String> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }
        debug!(kind = %kind, namespace, name, status = status.as_u16(), "api request failed");
        Err(status_error(status, kind, namespace, name, body))
    }

    async fn send_json(
        &self,
        builder: RequestBuilder,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Value> {
        let body = self.send(builder, kind, namespace, name).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ClusterApi for KubeHttp {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<Value> {
        let url = object_url(&self.base_url, kind, namespace, name);
        self.send_json(self.client.get(url), kind, namespace, name).await
    }

    async fn list(&self, kind: ResourceKind, namespace: &str) -> ClusterResult<Vec<Value>> {
        let url = collection_url(&self.base_url, kind, namespace);
        let mut body = self.send_json(self.client.get(url), kind, namespace, "").await?;
        match body.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(ClusterError::Api {
                status: 200,
                message: format!("unexpected items in {} list: {}", kind, other),
            }),
        }
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        let name = object_name(&object);
        let url = collection_url(&self.base_url, kind, namespace);
        self.send_json(self.client.post(url).json(&object), kind, namespace, &name)
            .await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        let name = object_name(&object);
        let url = object_url(&self.base_url, kind, namespace, &name);
        self.send_json(self.client.put(url).json(&object), kind, namespace, &name)
            .await
    }

    async fn update_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        let name = object_name(&object);
        let url = format!("{}/status", object_url(&self.base_url, kind, namespace, &name));
        self.send_json(self.client.put(url).json(&object), kind, namespace, &name)
            .await
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()> {
        let url = object_url(&self.base_url, kind, namespace, name);
        self.send(self.client.delete(url), kind, namespace, name)
            .await
            .map(|_| ())
    }
}

fn in_cluster_url() -> anyhow::Result<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| anyhow!("no --api-server given and KUBERNETES_SERVICE_HOST is not set"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    Ok(format!("https://{}:{}", host, port))
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

fn object_name(object: &Value) -> String {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// API prefix and plural resource name for a kind.
fn route(kind: ResourceKind) -> (String, &'static str) {
    let custom = || format!("apis/{}", API_VERSION);
    match kind {
        ResourceKind::ReplicatedSet => (custom(), "replicatedsets"),
        ResourceKind::SentinelSet => (custom(), "sentinelsets"),
        ResourceKind::WorkloadSet => ("apis/apps/v1".to_string(), "statefulsets"),
        ResourceKind::Service => ("api/v1".to_string(), "services"),
        ResourceKind::ConfigMap => ("api/v1".to_string(), "configmaps"),
        ResourceKind::Secret => ("api/v1".to_string(), "secrets"),
        ResourceKind::Pod => ("api/v1".to_string(), "pods"),
    }
}

fn collection_url(base: &str, kind: ResourceKind, namespace: &str) -> String {
    let (prefix, plural) = route(kind);
    if namespace.is_empty() {
        format!("{}/{}/{}", base, prefix, plural)
    } else {
        format!("{}/{}/namespaces/{}/{}", base, prefix, namespace, plural)
    }
}

fn object_url(base: &str, kind: ResourceKind, namespace: &str, name: &str) -> String {
    format!("{}/{}", collection_url(base, kind, namespace), name)
}

fn status_error(
    status: StatusCode,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    body: String,
) -> ClusterError {
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    match status {
        StatusCode::NOT_FOUND => ClusterError::not_found(kind, namespace, name),
        StatusCode::CONFLICT => ClusterError::Conflict {
            kind: kind.to_string(),
            name: format!("{}/{}", namespace, name),
            message,
        },
        other => ClusterError::Api {
            status: other.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_per_kind() {
        let base = "https://api:6443";
        assert_eq!(
            object_url(base, ResourceKind::ReplicatedSet, "db", "cache"),
            "https://api:6443/apis/redis.warden.io/v1/namespaces/db/replicatedsets/cache"
        );
        assert_eq!(
            object_url(base, ResourceKind::WorkloadSet, "db", "cache"),
            "https://api:6443/apis/apps/v1/namespaces/db/statefulsets/cache"
        );
        assert_eq!(
            collection_url(base, ResourceKind::Pod, "db"),
            "https://api:6443/api/v1/namespaces/db/pods"
        );
        assert_eq!(
            collection_url(base, ResourceKind::SentinelSet, ""),
            "https://api:6443/apis/redis.warden.io/v1/sentinelsets"
        );
    }

    #[test]
    fn test_status_mapping() {
        let err = status_error(StatusCode::NOT_FOUND, ResourceKind::Pod, "db", "cache-0", String::new());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Pod db/cache-0 not found");

        let body = r#"{"kind":"Status","message":"the object has been modified"}"#.to_string();
        let err = status_error(StatusCode::CONFLICT, ResourceKind::ConfigMap, "db", "c", body);
        assert!(
            matches!(err, ClusterError::Conflict { ref message, .. } if message == "the object has been modified")
        );

        let err = status_error(
            StatusCode::FORBIDDEN,
            ResourceKind::Secret,
            "db",
            "tls",
            "forbidden".to_string(),
        );
        assert!(matches!(err, ClusterError::Api { status: 403, .. }));
    }

    #[test]
    fn test_explicit_config_without_service_account() {
        let mut token = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut token, b"abc\n").unwrap();

        let api = KubeHttp::new(KubeConfig {
            api_server: Some("https://example:6443/".into()),
            token_file: Some(token.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(api.base_url, "https://example:6443");
        assert_eq!(api.token.as_deref(), Some("abc"));
    }
}
