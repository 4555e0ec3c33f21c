use std::sync::Arc;

use warden_core::cluster::{ClusterApi, ResourceKind, TypedApi};
use warden_core::config_text::ConfigFiles;
use warden_core::memory::MemoryCluster;
use warden_core::reconcile::Outcome;
use warden_core::resources::{
    ObjectKey, ObjectMeta, Pod, ReplicatedSet, ReplicatedSetSpec, SentinelBinding, SentinelSet,
    SentinelSetSpec, PRIMARY_LABEL, REDIS_CONF, SENTINEL_CONF, SENTINEL_SET_FINALIZER,
};
use warden_core::settings::OperatorSettings;
use warden_core::testing::FakeRedis;
use warden_core::{SentinelReconciler, Severity};

fn host(i: usize) -> String {
    format!("cache-{}.cache-headless.db.svc.cluster.local", i)
}

fn sentinel_host(i: usize) -> String {
    format!("guard-{}.guard-headless.db.svc.cluster.local", i)
}

fn healthy_listing() -> String {
    format!("[map[name:mymaster ip:{} port:6379 flags:master]]", host(0))
}

struct Fixture {
    cluster: Arc<MemoryCluster>,
    redis: FakeRedis,
    reconciler: SentinelReconciler,
    key: ObjectKey,
    sentinel: SentinelSet,
}

async fn fixture(sentinel_conf: Option<&str>, with_replicated: bool) -> Fixture {
    let cluster = Arc::new(MemoryCluster::new());
    let redis = FakeRedis::new();

    if with_replicated {
        let set = ReplicatedSet::new(
            "db",
            "cache",
            ReplicatedSetSpec {
                replicas: 3,
                sentinel: Some(SentinelBinding {
                    sentinel_name: "guard".into(),
                    downtime_millis: Some(5000),
                }),
                config: ConfigFiles::new().with_file(REDIS_CONF, "port 6379\n"),
                ..Default::default()
            },
        );
        cluster
            .create(ResourceKind::ReplicatedSet, "db", serde_json::to_value(&set).unwrap())
            .await
            .unwrap();
    }

    let mut config = ConfigFiles::new();
    if let Some(conf) = sentinel_conf {
        config = config.with_file(SENTINEL_CONF, conf);
    }
    let sentinel = SentinelSet::new(
        "db",
        "guard",
        SentinelSetSpec {
            quorum: 2,
            master_name: "mymaster".into(),
            replicated_set_name: "cache".into(),
            replicas: 3,
            config,
            image: None,
        },
    );
    cluster
        .create(ResourceKind::SentinelSet, "db", serde_json::to_value(&sentinel).unwrap())
        .await
        .unwrap();

    for i in 0..3 {
        let mut meta = ObjectMeta::named("db", &format!("guard-{}", i));
        meta.labels = sentinel.labels();
        cluster.seed(ResourceKind::Pod, "db", serde_json::to_value(Pod::new(meta)).unwrap());
        redis.set_masters(&sentinel_host(i), &healthy_listing());
    }

    redis.set_info(&host(0), "role:master\r\nconnected_slaves:2\r\n");
    redis.set_info(&host(1), "role:slave\r\n");
    redis.set_info(&host(2), "role:slave\r\n");

    let reconciler = SentinelReconciler::new(
        cluster.clone(),
        redis.transport(),
        OperatorSettings::default(),
    );
    Fixture {
        cluster,
        redis,
        reconciler,
        key: ObjectKey::new("db", "guard"),
        sentinel,
    }
}

async fn primary_labels(cluster: &MemoryCluster) -> Vec<Option<String>> {
    let mut labels = Vec::new();
    for i in 0..3 {
        let pod: Pod = cluster.get_typed("db", &format!("guard-{}", i)).await.unwrap();
        labels.push(pod.metadata.labels.get(PRIMARY_LABEL).cloned());
    }
    labels
}

#[tokio::test]
async fn test_rewrites_monitor_directive_and_labels_pods() {
    let f = fixture(Some("port 26379\nsentinel monitor mymaster 127.0.0.1 6379 2\n"), true).await;

    let outcome = f.reconciler.reconcile_sentinel(&f.key).await.unwrap();
    assert!(matches!(outcome, Outcome::RequeueAfter(_)));

    let config_map = f.cluster.get(ResourceKind::ConfigMap, "db", "guard-conf").await.unwrap();
    let text = config_map["data"][SENTINEL_CONF].as_str().unwrap();
    assert!(text.contains(&format!("sentinel monitor mymaster {} 6379 2", host(0))));
    assert!(text.contains("sentinel resolve-hostnames yes"));
    assert!(text.contains("sentinel down-after-milliseconds mymaster 5000"));
    assert!(!text.contains("127.0.0.1"));

    assert!(f.cluster.contains(ResourceKind::WorkloadSet, "db", "guard"));
    assert!(f.cluster.contains(ResourceKind::Service, "db", "guard-headless"));

    let sentinel: SentinelSet = f.cluster.get_typed("db", "guard").await.unwrap();
    assert!(sentinel.metadata.has_finalizer(SENTINEL_SET_FINALIZER));

    assert_eq!(primary_labels(&f.cluster).await, vec![Some(host(0)); 3]);
    assert!(f.redis.commands().is_empty());
}

#[tokio::test]
async fn test_missing_sentinel_conf_is_critical() {
    let f = fixture(None, true).await;
    let err = f.reconciler.reconcile_sentinel(&f.key).await.unwrap_err();
    assert_eq!(err.severity(), Severity::Critical);
}

#[tokio::test]
async fn test_missing_replicated_set_is_critical() {
    let f = fixture(Some("port 26379\n"), false).await;
    let err = f.reconciler.reconcile_sentinel(&f.key).await.unwrap_err();
    assert_eq!(err.severity(), Severity::Critical);
    assert!(err.to_string().contains("cache"));
}

#[tokio::test]
async fn test_uncertain_primary_defers_and_labels_none() {
    let f = fixture(Some("port 26379\n"), true).await;
    f.redis.set_info(&host(1), "role:master\r\nconnected_slaves:0\r\n");

    let err = f.reconciler.reconcile_sentinel(&f.key).await.unwrap_err();
    assert_eq!(err.severity(), Severity::Deferred);
    assert!(!f.cluster.contains(ResourceKind::ConfigMap, "db", "guard-conf"));
    assert_eq!(primary_labels(&f.cluster).await, vec![Some("none".to_string()); 3]);
}

#[tokio::test]
async fn test_restarts_sentinel_down_past_threshold() {
    let f = fixture(Some("port 26379\n"), true).await;
    f.redis.set_masters(
        &sentinel_host(1),
        &format!("[map[name:mymaster ip:{} port:6379 s-down-time:30000]]", host(0)),
    );
    f.redis.set_masters(
        &sentinel_host(2),
        &format!("[map[name:mymaster ip:{} port:6379 s-down-time:1500]]", host(0)),
    );

    f.reconciler.reconcile_sentinel(&f.key).await.unwrap();

    let deleted: Vec<String> = f
        .cluster
        .deleted()
        .into_iter()
        .filter(|(kind, _, _)| *kind == ResourceKind::Pod)
        .map(|(_, _, name)| name)
        .collect();
    assert_eq!(deleted, vec!["guard-1".to_string()]);
}

#[tokio::test]
async fn test_restart_threshold_is_exclusive() {
    let f = fixture(Some("port 26379\n"), true).await;
    f.redis.set_masters(
        &sentinel_host(0),
        &format!("[map[name:mymaster ip:{} port:6379 s-down-time:20000]]", host(0)),
    );
    f.redis.set_masters(
        &sentinel_host(2),
        &format!("[map[name:mymaster ip:{} port:6379 s-down-time:20001]]", host(0)),
    );

    f.reconciler.reconcile_sentinel(&f.key).await.unwrap();

    let deleted: Vec<String> = f
        .cluster
        .deleted()
        .into_iter()
        .filter(|(kind, _, _)| *kind == ResourceKind::Pod)
        .map(|(_, _, name)| name)
        .collect();
    assert_eq!(deleted, vec!["guard-2".to_string()]);
}

#[tokio::test]
async fn test_malformed_down_time_is_transient() {
    let f = fixture(Some("port 26379\n"), true).await;
    f.redis.set_masters(&sentinel_host(0), "[map[ip:x s-down-time:soon]]");

    let err = f.reconciler.reconcile_sentinel(&f.key).await.unwrap_err();
    assert_eq!(err.severity(), Severity::Transient);
}

#[tokio::test]
async fn test_sentinel_password_is_used_for_sentinels() {
    let f = fixture(Some("port 26379\nrequirepass guardpw\n"), true).await;
    f.reconciler.reconcile_sentinel(&f.key).await.unwrap();

    assert_eq!(f.redis.last_password(&sentinel_host(0)), Some("guardpw".into()));
    assert_eq!(f.redis.last_password(&host(0)), None);
    assert_eq!(f.sentinel.quorum(), 2);
}

#[tokio::test]
async fn test_deleted_sentinel_set_finishes() {
    let f = fixture(Some("port 26379\n"), true).await;
    f.reconciler.reconcile_sentinel(&f.key).await.unwrap();

    f.cluster.delete(ResourceKind::SentinelSet, "db", "guard").await.unwrap();
    assert_eq!(f.reconciler.reconcile_sentinel(&f.key).await.unwrap(), Outcome::Done);
    assert!(!f.cluster.contains(ResourceKind::SentinelSet, "db", "guard"));
}
