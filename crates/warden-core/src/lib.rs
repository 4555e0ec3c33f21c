pub mod cluster;
pub mod config_text;
pub mod controller;
pub mod election;
pub mod errors;
pub mod manifests;
pub mod memory;
pub mod probe;
pub mod propagation;
pub mod reconcile;
pub mod replication;
pub mod resources;
pub mod sentinel;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tls;
pub mod wire;

pub use cluster::{ClusterApi, ClusterError, ResourceKind, TypedApi};
pub use controller::{Controller, ReconcileObserver};
pub use errors::{Result, Severity, WardenError};
pub use reconcile::{Outcome, Reconciler};
pub use replication::ReplicationReconciler;
pub use resources::{ObjectKey, ReplicatedSet, SentinelSet};
pub use sentinel::SentinelReconciler;
pub use settings::OperatorSettings;
pub use wire::{ConnectSettings, Endpoint, RedisTransport, RedisWire};
