//! Sentinel set reconciler
//!
//! Keeps the Sentinel config pointed at the replicated set's current
//! primary, restarts sentinels that have been subjectively down too long
//! and labels sentinel pods with the primary they should be watching.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ResourceKind, TypedApi};
use crate::config_text::ConfigFiles;
use crate::errors::{Result, WardenError};
use crate::manifests::{self, WorkloadShape};
use crate::probe::{MemberObservation, ProbeQuery, TopologyProbe, ROLE_MASTER, S_DOWN_TIME};
use crate::reconcile::{advance_finalizer, FinalizerStep, Outcome, Reconciler};
use crate::replication::{member_settings, pods_of};
use crate::resources::{
    label_value, ObjectKey, ReplicatedSet, Resource, SentinelSet, PRIMARY_LABEL, SENTINEL_CONF,
    SENTINEL_SET_FINALIZER,
};
use crate::settings::OperatorSettings;
use crate::wire::{ConnectSettings, RedisTransport};

const NO_PRIMARY: &str = "none";

pub struct SentinelReconciler {
    api: Arc<dyn ClusterApi>,
    probe: TopologyProbe,
    settings: OperatorSettings,
}

impl SentinelReconciler {
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

    #[instrument(skip(self), fields(sentinel = %key))]
    pub async fn reconcile_sentinel(&self, key: &ObjectKey) -> Result<Outcome> {
        let sentinel: SentinelSet =
            match advance_finalizer(self.api.as_ref(), key, SENTINEL_SET_FINALIZER).await? {
                FinalizerStep::Gone | FinalizerStep::Released => return Ok(Outcome::Done),
                FinalizerStep::Active(sentinel) => sentinel,
            };

        if !sentinel.spec.config.contains(SENTINEL_CONF) {
            return Err(WardenError::InvalidConfig(format!(
                "{} not found in sentinel config",
                SENTINEL_CONF
            )));
        }
        let replicated = self.bound_set(&sentinel).await?;

        let connect = member_settings(self.api.as_ref(), &replicated, &self.settings).await?;
        let observations = self
            .probe
            .observe(&replicated.member_endpoints(), &connect, ProbeQuery::Replication)
            .await?;
        let Some(primary) = single_primary(&observations) else {
            self.reflect_primary(&sentinel, None).await;
            return Err(WardenError::Deferred(
                "uncertain primary address, not updating sentinel config".into(),
            ));
        };

        let config = monitor_config(&sentinel, &replicated, &primary);
        self.upsert_dependents(&sentinel, &replicated, &config).await?;

        let sentinel_connect = connect.clone().with_password(sentinel.password());
        self.restart_stuck_sentinels(&sentinel, &sentinel_connect).await?;
        self.reflect_primary(&sentinel, Some(primary.as_str())).await;

        Ok(Outcome::RequeueAfter(self.settings.tick_interval()))
    }

    /// The replicated set this fleet watches; its absence is a
    /// configuration error.
    async fn bound_set(&self, sentinel: &SentinelSet) -> Result<ReplicatedSet> {
        let name = &sentinel.spec.replicated_set_name;
        match self
            .api
            .get_typed::<ReplicatedSet>(&sentinel.metadata.namespace, name)
            .await
        {
            Ok(set) => Ok(set),
            Err(e) if e.is_not_found() => Err(WardenError::not_found(
                "ReplicatedSet",
                &sentinel.metadata.namespace,
                name,
            )
            .critical()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_dependents(
        &self,
        sentinel: &SentinelSet,
        replicated: &ReplicatedSet,
        config: &ConfigFiles,
    ) -> Result<()> {
        let tls_secret = replicated.spec.tls.as_ref().map(|t| t.secret_name.clone());
        let shape = WorkloadShape::for_sentinel(sentinel, tls_secret);
        let ns = &sentinel.metadata.namespace;

        self.api
            .upsert(ResourceKind::ConfigMap, ns, manifests::config_map(&shape, config.as_map()))
            .await?;
        self.api
            .upsert(ResourceKind::Service, ns, manifests::headless_service(&shape))
            .await?;
        self.api
            .upsert(ResourceKind::Service, ns, manifests::client_service(&shape))
            .await?;
        self.api
            .upsert(ResourceKind::WorkloadSet, ns, manifests::workload_set(&shape))
            .await?;
        Ok(())
    }

    /// Delete the pod of every sentinel that has been subjectively down
    /// for longer than the restart threshold, so it comes back with the
    /// current config.
    async fn restart_stuck_sentinels(
        &self,
        sentinel: &SentinelSet,
        connect: &ConnectSettings,
    ) -> Result<()> {
        let views = self
            .probe
            .observe(&sentinel.member_endpoints(), connect, ProbeQuery::SentinelMasters)
            .await?;

        for view in views {
            let Some(raw) = view.get(S_DOWN_TIME) else {
                continue;
            };
            let down_ms: u64 = raw.trim().parse().map_err(|_| WardenError::MalformedReply {
                address: view.address.clone(),
                reason: format!("{} is not a duration: {:?}", S_DOWN_TIME, raw),
            })?;
            if down_ms <= self.settings.restart_threshold_ms {
                continue;
            }

            let pod = sentinel.pod_name(view.ordinal);
            info!(pod = %pod, down_ms, "sentinel down too long, restarting");
            match self
                .api
                .delete(ResourceKind::Pod, &sentinel.metadata.namespace, &pod)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!(pod = %pod, "pod already gone"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Label every sentinel pod with the primary it should be watching.
    /// Failures are ignored per pod.
    async fn reflect_primary(&self, sentinel: &SentinelSet, primary: Option<&str>) {
        let value = label_value(primary.unwrap_or(NO_PRIMARY));
        let pods = match pods_of(
            self.api.as_ref(),
            &sentinel.metadata.namespace,
            &sentinel.labels(),
        )
        .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "could not list sentinel pods");
                return;
            }
        };

        for mut pod in pods {
            if pod.metadata.labels.get(PRIMARY_LABEL) == Some(&value) {
                continue;
            }
            pod.metadata
                .labels
                .insert(PRIMARY_LABEL.to_string(), value.clone());
            if let Err(e) = self.api.update_typed(&pod).await {
                debug!(pod = %pod.metadata.name, error = %e, "failed to update primary label");
            }
        }
    }
}

#[async_trait]
impl Reconciler for SentinelReconciler {
    fn kind(&self) -> &'static str {
        "sentinelset"
    }

    async fn list_keys(&self, namespace: &str) -> Result<Vec<ObjectKey>> {
        let sets: Vec<SentinelSet> = self.api.list_typed(namespace).await?;
        Ok(sets.iter().map(Resource::key).collect())
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        self.reconcile_sentinel(key).await
    }
}

/// Address of the only member reporting `role:master`.
fn single_primary(observations: &[MemberObservation]) -> Option<String> {
    let mut masters = observations.iter().filter(|o| o.has_role(ROLE_MASTER));
    match (masters.next(), masters.next()) {
        (Some(primary), None) => Some(primary.address.clone()),
        _ => None,
    }
}

/// Sentinel config with the monitor directive pointing at `primary`.
pub fn monitor_config(
    sentinel: &SentinelSet,
    replicated: &ReplicatedSet,
    primary: &str,
) -> ConfigFiles {
    let mut config = sentinel.spec.config.clone();
    let master = &sentinel.spec.master_name;

    config.set_value(
        SENTINEL_CONF,
        "sentinel monitor",
        &format!("{} {} {} {}", master, primary, replicated.port(), sentinel.quorum()),
    );
    config.set_value(SENTINEL_CONF, "sentinel resolve-hostnames", "yes");
    config.set_value(SENTINEL_CONF, "sentinel announce-hostnames", "yes");

    if let Some(ms) = replicated
        .spec
        .sentinel
        .as_ref()
        .and_then(|b| b.downtime_millis)
    {
        config.set_value(
            SENTINEL_CONF,
            &format!("sentinel down-after-milliseconds {}", master),
            &ms.to_string(),
        );
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ReplicatedSetSpec, SentinelBinding, SentinelSetSpec, REDIS_CONF};

    fn sentinel(conf: &str) -> SentinelSet {
        SentinelSet::new(
            "db",
            "guard",
            SentinelSetSpec {
                quorum: 2,
                master_name: "mymaster".into(),
                replicated_set_name: "cache".into(),
                replicas: 3,
                config: ConfigFiles::new().with_file(SENTINEL_CONF, conf),
                image: None,
            },
        )
    }

    fn replicated(downtime: Option<u64>) -> ReplicatedSet {
        ReplicatedSet::new(
            "db",
            "cache",
            ReplicatedSetSpec {
                replicas: 3,
                sentinel: Some(SentinelBinding {
                    sentinel_name: "guard".into(),
                    downtime_millis: downtime,
                }),
                config: ConfigFiles::new().with_file(REDIS_CONF, "port 6380"),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_monitor_config_replaces_directives() {
        let conf = "port 26379\nsentinel monitor mymaster 127.0.0.1 6379 1\nSENTINEL resolve-hostnames no\n";
        let out = monitor_config(&sentinel(conf), &replicated(None), "cache-1.cache-headless.db.svc.cluster.local");
        let text = out.file(SENTINEL_CONF).unwrap();

        assert_eq!(text.matches("sentinel monitor").count(), 1);
        assert_eq!(
            out.values(SENTINEL_CONF, "sentinel monitor").unwrap(),
            vec!["mymaster", "cache-1.cache-headless.db.svc.cluster.local", "6380", "2"]
        );
        assert_eq!(out.value(SENTINEL_CONF, "sentinel resolve-hostnames"), Some("yes".into()));
        assert_eq!(out.value(SENTINEL_CONF, "sentinel announce-hostnames"), Some("yes".into()));
        assert!(!text.contains("down-after-milliseconds"));
    }

    #[test]
    fn test_monitor_config_sets_down_after() {
        let out = monitor_config(&sentinel("port 26379"), &replicated(Some(5000)), "p");
        assert_eq!(
            out.value(SENTINEL_CONF, "sentinel down-after-milliseconds mymaster"),
            Some("5000".into())
        );
    }

    #[test]
    fn test_single_primary() {
        let master = |i: usize| {
            MemberObservation::new(
                &format!("r-{}", i),
                i,
                [("role".to_string(), "master".to_string())].into_iter().collect(),
            )
        };
        assert_eq!(single_primary(&[master(0)]), Some("r-0".into()));
        assert_eq!(single_primary(&[master(0), master(1)]), None);
        assert_eq!(single_primary(&[]), None);
    }
}
