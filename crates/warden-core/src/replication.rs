//! Replicated set reconciler
//!
//! One invocation walks the finalizer state machine, upserts the dependent
//! resources and the workload, then probes the members and converges them
//! on a single primary. Member roles and the observed primary are mirrored
//! into pod labels and the object status on a best-effort basis.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ResourceKind, TypedApi};
use crate::election::{elect_with_sentinels, elect_without_sentinel, ElectionDecision, RoleCounts};
use crate::errors::{Result, WardenError};
use crate::manifests::{self, WorkloadShape};
use crate::probe::{MemberObservation, ProbeQuery, TopologyProbe, ROLE_MASTER};
use crate::propagation::propagate;
use crate::reconcile::{advance_finalizer, FinalizerStep, Outcome, Reconciler};
use crate::resources::{
    ObjectKey, Pod, ReplicatedSet, Resource, SentinelSet, REPLICATED_SET_FINALIZER, ROLE_LABEL,
};
use crate::settings::OperatorSettings;
use crate::tls::TlsMaterial;
use crate::wire::{ConnectSettings, Endpoint, RedisTransport};

pub struct ReplicationReconciler {
    api: Arc<dyn ClusterApi>,
    probe: TopologyProbe,
    settings: OperatorSettings,
}

impl ReplicationReconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        transport: Arc<dyn RedisTransport>,
        settings: OperatorSettings,
    ) -> Self {
        Self {
            api,
            probe: TopologyProbe::new(transport),
            settings,
        }
    }

    #[instrument(skip(self), fields(set = %key))]
    pub async fn reconcile_set(&self, key: &ObjectKey) -> Result<Outcome> {
        let set: ReplicatedSet =
            match advance_finalizer(self.api.as_ref(), key, REPLICATED_SET_FINALIZER).await? {
                FinalizerStep::Gone | FinalizerStep::Released => return Ok(Outcome::Done),
                FinalizerStep::Active(set) => set,
            };

        self.upsert_dependents(&set).await?;
        self.upsert_workload(&set).await?;

        let connect = member_settings(self.api.as_ref(), &set, &self.settings).await?;
        let endpoints = set.member_endpoints();
        let observations = self
            .probe
            .observe(&endpoints, &connect, ProbeQuery::Replication)
            .await?;

        let converged = self
            .update_primary(&set, &endpoints, &connect, &observations)
            .await;

        self.reflect_roles(&set, &observations).await;
        self.reflect_status(&set, &observations).await;

        converged?;
        Ok(Outcome::RequeueAfter(self.settings.tick_interval()))
    }

    async fn upsert_dependents(&self, set: &ReplicatedSet) -> Result<()> {
        let shape = WorkloadShape::for_replicated(set);
        let ns = &set.metadata.namespace;
        self.api
            .upsert(ResourceKind::Service, ns, manifests::headless_service(&shape))
            .await?;
        self.api
            .upsert(ResourceKind::Service, ns, manifests::client_service(&shape))
            .await?;
        self.api
            .upsert(
                ResourceKind::ConfigMap,
                ns,
                manifests::config_map(&shape, set.spec.config.as_map()),
            )
            .await?;
        Ok(())
    }

    async fn upsert_workload(&self, set: &ReplicatedSet) -> Result<()> {
        let shape = WorkloadShape::for_replicated(set);
        self.api
            .upsert(
                ResourceKind::WorkloadSet,
                &set.metadata.namespace,
                manifests::workload_set(&shape),
            )
            .await?;
        Ok(())
    }

    async fn update_primary(
        &self,
        set: &ReplicatedSet,
        endpoints: &[Endpoint],
        connect: &ConnectSettings,
        observations: &[MemberObservation],
    ) -> Result<()> {
        if observations.is_empty() {
            debug!("no reachable members");
            return Ok(());
        }
        if RoleCounts::of(observations).is_steady() {
            return Ok(());
        }

        let decision = match &set.spec.sentinel {
            None => elect_without_sentinel(observations)?,
            Some(binding) => {
                let lookup: std::result::Result<SentinelSet, _> = self
                    .api
                    .get_typed(&set.metadata.namespace, &binding.sentinel_name)
                    .await;
                match lookup {
                    Ok(sentinel) => self.ask_sentinels(set, &sentinel, connect).await?,
                    Err(e) if e.is_not_found() => {
                        debug!(sentinel = %binding.sentinel_name, "sentinel set not found, deciding alone");
                        elect_without_sentinel(observations)?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        match decision.winner() {
            Some(candidate) => {
                info!(master = %candidate, "electing new primary");
                propagate(self.probe.transport().as_ref(), endpoints, connect, candidate).await?;
            }
            None => info!("uncertain about the current primary, not promoting"),
        }
        Ok(())
    }

    async fn ask_sentinels(
        &self,
        set: &ReplicatedSet,
        sentinel: &SentinelSet,
        connect: &ConnectSettings,
    ) -> Result<ElectionDecision> {
        let sentinel_connect = connect.clone().with_password(sentinel.password());
        let views = self
            .probe
            .observe(
                &sentinel.member_endpoints(),
                &sentinel_connect,
                ProbeQuery::SentinelMasters,
            )
            .await?;
        if views.is_empty() {
            return Err(WardenError::Redis(format!(
                "failed to query sentinel masters for {}",
                set.metadata.name
            )));
        }

        let decision = elect_with_sentinels(&views, sentinel.quorum());
        if !decision.certain {
            info!(views = views.len(), quorum = sentinel.quorum(), "sentinels have not agreed on a primary");
        }
        Ok(decision)
    }

    /// Mirror each member's role into its pod's role label. Failures are
    /// ignored per pod.
    async fn reflect_roles(&self, set: &ReplicatedSet, observations: &[MemberObservation]) {
        let pods = match pods_of(self.api.as_ref(), &set.metadata.namespace, &set.labels()).await {
            Ok(pods) => pods,
            Err(e) => {
                debug!(error = %e, "could not list pods for role labels");
                return;
            }
        };

        for mut pod in pods {
            let Some(index) = pod.metadata.pod_index() else {
                continue;
            };
            let Some(role) = observations
                .iter()
                .find(|o| o.ordinal == index)
                .and_then(|o| o.role())
            else {
                continue;
            };
            if pod.metadata.labels.get(ROLE_LABEL).map(String::as_str) == Some(role) {
                continue;
            }
            pod.metadata
                .labels
                .insert(ROLE_LABEL.to_string(), role.to_string());
            if let Err(e) = self.api.update_typed(&pod).await {
                debug!(pod = %pod.metadata.name, error = %e, "failed to update role label");
            }
        }
    }

    async fn reflect_status(&self, set: &ReplicatedSet, observations: &[MemberObservation]) {
        let masters: Vec<&MemberObservation> =
            observations.iter().filter(|o| o.has_role(ROLE_MASTER)).collect();
        let [primary] = masters.as_slice() else {
            return;
        };
        if set.status.primary.as_deref() == Some(primary.address.as_str()) {
            return;
        }

        let mut updated = set.clone();
        updated.status.primary = Some(primary.address.clone());
        if let Err(e) = self.api.update_status_typed(&updated).await {
            warn!(error = %e, "failed to record primary in status");
        }
    }
}

#[async_trait]
impl Reconciler for ReplicationReconciler {
    fn kind(&self) -> &'static str {
        "replicatedset"
    }

    async fn list_keys(&self, namespace: &str) -> Result<Vec<ObjectKey>> {
        let sets: Vec<ReplicatedSet> = self.api.list_typed(namespace).await?;
        Ok(sets.iter().map(Resource::key).collect())
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        self.reconcile_set(key).await
    }
}

/// Connection settings for the members of `set`: password from
/// `redis.conf`, TLS material from the referenced secret.
pub async fn member_settings(
    api: &dyn ClusterApi,
    set: &ReplicatedSet,
    settings: &OperatorSettings,
) -> Result<ConnectSettings> {
    let tls = match &set.spec.tls {
        Some(tls) => Some(TlsMaterial::load(api, &set.metadata.namespace, &tls.secret_name).await?),
        None => None,
    };
    Ok(settings
        .connect_settings()
        .with_password(set.password())
        .with_tls(tls))
}

/// Pods in `namespace` carrying every label in `selector`.
pub async fn pods_of(
    api: &dyn ClusterApi,
    namespace: &str,
    selector: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<Pod>> {
    let pods: Vec<Pod> = api.list_typed(namespace).await?;
    Ok(pods
        .into_iter()
        .filter(|pod| {
            selector
                .iter()
                .all(|(k, v)| pod.metadata.labels.get(k) == Some(v))
        })
        .collect())
}
