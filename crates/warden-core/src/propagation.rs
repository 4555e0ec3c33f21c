//! Realises an election decision across the replicated set
//!
//! Every member is visited. The candidate is told to stop replicating,
//! everyone else is pointed at the candidate. A secondary that cannot be
//! reached is logged and skipped; it is corrected on a later tick. Failing
//! to promote the candidate itself is reported once all members were tried.

use tracing::{info, instrument, warn};

use crate::errors::{Result, WardenError};
use crate::wire::{ConnectSettings, Endpoint, RedisTransport};

/// Outcome per member, in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub promoted: bool,
    pub repointed: Vec<usize>,
    pub unreachable: Vec<usize>,
}

#[instrument(skip(transport, endpoints, settings), fields(members = endpoints.len()))]
pub async fn propagate(
    transport: &dyn RedisTransport,
    endpoints: &[Endpoint],
    settings: &ConnectSettings,
    candidate: &str,
) -> Result<PropagationReport> {
    let primary_port = endpoints
        .iter()
        .find(|e| e.host == candidate)
        .or_else(|| endpoints.first())
        .map(|e| e.port)
        .ok_or_else(|| WardenError::Other("no members to propagate to".into()))?;

    let mut report = PropagationReport::default();
    let mut promotion_error = None;

    for endpoint in endpoints {
        let is_candidate = endpoint.host == candidate;
        let upstream = if is_candidate {
            None
        } else {
            Some((candidate, primary_port))
        };

        let result = async {
            let mut session = transport.open(endpoint, settings).await?;
            session.replicate_from(upstream).await
        }
        .await;

        match (result, is_candidate) {
            (Ok(()), true) => {
                info!(master = %candidate, "promoted member to primary");
                report.promoted = true;
            }
            (Ok(()), false) => report.repointed.push(endpoint.ordinal),
            (Err(e), true) => {
                warn!(master = %candidate, error = %e, "failed to promote candidate");
                promotion_error = Some(e);
            }
            (Err(e), false) => {
                warn!(member = %endpoint, error = %e, "failed to repoint secondary, probably down");
                report.unreachable.push(endpoint.ordinal);
            }
        }
    }

    match promotion_error {
        Some(e) => Err(WardenError::Redis(format!(
            "error setting replication master {}: {}",
            candidate, e
        ))),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRedis, RoleCommand};
    use std::time::Duration;

    fn endpoints() -> Vec<Endpoint> {
        (0..3)
            .map(|i| Endpoint {
                host: format!("r-{}", i),
                port: 6380,
                ordinal: i,
            })
            .collect()
    }

    fn settings() -> ConnectSettings {
        ConnectSettings::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_candidate_promoted_others_repointed() {
        let fake = FakeRedis::new();
        let report = propagate(&fake, &endpoints(), &settings(), "r-1").await.unwrap();

        assert!(report.promoted);
        assert_eq!(report.repointed, vec![0, 2]);
        let commands = fake.commands();
        assert_eq!(
            commands[1],
            RoleCommand {
                host: "r-1".into(),
                primary: None
            }
        );
        assert_eq!(commands[0].primary, Some(("r-1".to_string(), 6380)));
        assert!(fake.info("r-1").unwrap().starts_with("role:master"));
    }

    #[tokio::test]
    async fn test_down_secondary_does_not_abort() {
        let fake = FakeRedis::new();
        fake.set_down("r-0");
        let report = propagate(&fake, &endpoints(), &settings(), "r-1").await.unwrap();
        assert_eq!(report.unreachable, vec![0]);
        assert_eq!(report.repointed, vec![2]);
    }

    #[tokio::test]
    async fn test_failed_promotion_still_visits_everyone() {
        let fake = FakeRedis::new();
        fake.fail_slaveof("r-0");
        let err = propagate(&fake, &endpoints(), &settings(), "r-0").await.unwrap_err();
        assert!(err.to_string().contains("r-0"));
        assert_eq!(fake.commands().len(), 3);
    }
}
