//! Error taxonomy for the reconcilers
//!
//! Every failure a reconcile step can produce carries a [`Severity`] so the
//! controller can decide between backoff-retry and a fixed-delay requeue.
//! "Uncertain" outcomes (no quorum, ties, ambiguous role counts) are not
//! errors at all; they surface as an abstaining `ElectionDecision`.

use thiserror::Error;

use crate::cluster::ClusterError;

pub type Result<T> = std::result::Result<T, WardenError>;

/// How the controller reacts to a failed reconcile step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// I/O against a member or the cluster API failed; retry with backoff.
    Transient,
    /// The resource is misconfigured; surfaced as an error on every tick.
    Critical,
    /// Not an error condition; requeue after the fixed short delay.
    Deferred,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Transient => "transient",
            Severity::Critical => "critical",
            Severity::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Error)]
pub enum WardenError {
    /// A managed or referenced resource does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Cluster API failure other than not-found
    #[error("cluster api error: {0}")]
    Cluster(#[from] ClusterError),

    /// Talking to a Redis or Sentinel member failed
    #[error("redis protocol error: {0}")]
    Redis(String),

    /// A member replied with something we could not interpret
    #[error("malformed reply from {address}: {reason}")]
    MalformedReply { address: String, reason: String },

    /// TLS material was missing or unreadable
    #[error("tls material error: {0}")]
    Tls(String),

    /// Required configuration is absent or invalid
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The step cannot run yet; try again shortly
    #[error("deferred: {0}")]
    Deferred(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("settings error: {0}")]
    Settings(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WardenError {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        WardenError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// True for both our own not-found and a cluster API 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WardenError::NotFound { .. } | WardenError::Cluster(ClusterError::NotFound { .. })
        )
    }

    pub fn severity(&self) -> Severity {
        match self {
            WardenError::InvalidConfig(_) => Severity::Critical,
            WardenError::Deferred(_) => Severity::Deferred,
            _ => Severity::Transient,
        }
    }

    /// Promote any error to critical, keeping its message.
    pub fn critical(self) -> Self {
        match self {
            e @ WardenError::InvalidConfig(_) => e,
            other => WardenError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for WardenError {
    fn from(e: redis::RedisError) -> Self {
        WardenError::Redis(e.to_string())
    }
}

impl From<String> for WardenError {
    fn from(s: String) -> Self {
        WardenError::Other(s)
    }
}

impl From<&str> for WardenError {
    fn from(s: &str) -> Self {
        WardenError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            WardenError::InvalidConfig("x".into()).severity(),
            Severity::Critical
        );
        assert_eq!(WardenError::Deferred("x".into()).severity(), Severity::Deferred);
        assert_eq!(WardenError::Redis("x".into()).severity(), Severity::Transient);
    }

    #[test]
    fn test_critical_promotion_keeps_message() {
        let err = WardenError::not_found("ReplicatedSet", "db", "cache").critical();
        assert_eq!(err.severity(), Severity::Critical);
        assert!(err.to_string().contains("db/cache"));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(WardenError::not_found("Pod", "ns", "p").is_not_found());
        let api = WardenError::Cluster(ClusterError::NotFound {
            kind: "ConfigMap".into(),
            name: "c".into(),
        });
        assert!(api.is_not_found());
        assert!(!WardenError::Other("x".into()).is_not_found());
    }
}
