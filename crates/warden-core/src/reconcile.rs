//! Reconcile plumbing shared by both reconcilers
//!
//! A managed object moves `Initializing -> Active -> Terminating -> Gone`.
//! The finalizer is the only persisted marker: absent means Initializing,
//! present means Active, a deletion timestamp means Terminating and a
//! missing object means Gone.

use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use tracing::{debug, info};

use crate::cluster::{ClusterApi, TypedApi};
use crate::errors::{Result, WardenError};
use crate::resources::{ObjectKey, ObjectMeta, Resource};

/// What the controller should do after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Object is gone or finalized; stop scheduling it
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Initializing,
    Active,
    Terminating,
    Gone,
}

impl ResourceState {
    pub fn of(meta: Option<&ObjectMeta>, finalizer: &str) -> Self {
        match meta {
            None => ResourceState::Gone,
            Some(m) if m.is_deleting() => ResourceState::Terminating,
            Some(m) if m.has_finalizer(finalizer) => ResourceState::Active,
            Some(_) => ResourceState::Initializing,
        }
    }
}

/// A per-kind reconciler the controller can drive.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Short kind label used in logs and metrics.
    fn kind(&self) -> &'static str;

    /// Objects currently present; an empty namespace lists all of them.
    async fn list_keys(&self, namespace: &str) -> Result<Vec<ObjectKey>>;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome>;
}

/// Result of walking the finalizer part of the state machine.
#[derive(Debug)]
pub enum FinalizerStep<R> {
    /// Object no longer exists
    Gone,
    /// Object is being deleted and has been released
    Released,
    /// Object is Active; continue reconciling with this copy
    Active(R),
}

/// Fetch `key` and apply the finalizer transitions. A freshly added
/// finalizer is persisted before returning so the rest of the invocation
/// works on the updated copy.
pub async fn advance_finalizer<R: Resource>(
    api: &dyn ClusterApi,
    key: &ObjectKey,
    finalizer: &str,
) -> Result<FinalizerStep<R>> {
    let mut object: R = match api.get_typed(&key.namespace, &key.name).await {
        Ok(object) => object,
        Err(e) if e.is_not_found() => {
            debug!(object = %key, "object not found, assuming it was deleted");
            return Ok(FinalizerStep::Gone);
        }
        Err(e) => return Err(WardenError::from(e)),
    };

    match ResourceState::of(Some(object.metadata()), finalizer) {
        ResourceState::Terminating => {
            if object.metadata_mut().remove_finalizer(finalizer) {
                api.update_typed(&object).await?;
                info!(object = %key, "finalizer removed");
            }
            Ok(FinalizerStep::Released)
        }
        ResourceState::Initializing => {
            object.metadata_mut().add_finalizer(finalizer);
            let object = api.update_typed(&object).await?;
            info!(object = %key, "finalizer added");
            Ok(FinalizerStep::Active(object))
        }
        ResourceState::Active => Ok(FinalizerStep::Active(object)),
        ResourceState::Gone => Ok(FinalizerStep::Gone),
    }
}

/// Exponential backoff with optional jitter for failing reconciles.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter_fraction: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter_fraction: 0.0,
            failures: 0,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next retry; grows with each consecutive failure.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.failures.min(31);
        self.failures = self.failures.saturating_add(1);

        let scaled = self.base.as_millis().saturating_mul(1u128 << shift);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        let bounded = raw.min(self.cap);

        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let spread = self.jitter_fraction;
        let factor = thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        let millis = (bounded.as_millis() as f64 * factor).round().max(0.0);
        Duration::from_millis(millis as u64).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::resources::{ReplicatedSet, ReplicatedSetSpec, REPLICATED_SET_FINALIZER};

    async fn seeded() -> (MemoryCluster, ObjectKey) {
        let cluster = MemoryCluster::new();
        let set = ReplicatedSet::new("db", "cache", ReplicatedSetSpec::default());
        cluster
            .create(ReplicatedSet::KIND, "db", serde_json::to_value(&set).unwrap())
            .await
            .unwrap();
        (cluster, ObjectKey::new("db", "cache"))
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(30));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let mut backoff =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.2);
        let delay = backoff.next_delay().as_millis();
        assert!((80..=120).contains(&delay));
    }

    #[test]
    fn test_resource_state() {
        let mut meta = ObjectMeta::named("db", "cache");
        assert_eq!(ResourceState::of(None, "f"), ResourceState::Gone);
        assert_eq!(ResourceState::of(Some(&meta), "f"), ResourceState::Initializing);
        meta.add_finalizer("f");
        assert_eq!(ResourceState::of(Some(&meta), "f"), ResourceState::Active);
        meta.deletion_timestamp = Some("now".into());
        assert_eq!(ResourceState::of(Some(&meta), "f"), ResourceState::Terminating);
    }

    #[tokio::test]
    async fn test_finalizer_lifecycle() {
        let (cluster, key) = seeded().await;

        let step = advance_finalizer::<ReplicatedSet>(&cluster, &key, REPLICATED_SET_FINALIZER)
            .await
            .unwrap();
        match step {
            FinalizerStep::Active(set) => {
                assert!(set.metadata.has_finalizer(REPLICATED_SET_FINALIZER))
            }
            other => panic!("expected active, got {:?}", other),
        }

        cluster.delete(ReplicatedSet::KIND, "db", "cache").await.unwrap();
        let step = advance_finalizer::<ReplicatedSet>(&cluster, &key, REPLICATED_SET_FINALIZER)
            .await
            .unwrap();
        assert!(matches!(step, FinalizerStep::Released));

        let step = advance_finalizer::<ReplicatedSet>(&cluster, &key, REPLICATED_SET_FINALIZER)
            .await
            .unwrap();
        assert!(matches!(step, FinalizerStep::Gone));
    }
}
