//! Topology probe
//!
//! Connects to every ordinal member, checks liveness and turns the status
//! reply into a flat attribute map. Unreachable members are skipped, never
//! reported as errors; a member that answers the ping but then fails the
//! status query is.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument};

use crate::errors::{Result, WardenError};
use crate::wire::{ConnectSettings, Endpoint, RedisTransport};

pub const ROLE: &str = "role";
pub const ROLE_MASTER: &str = "master";
pub const ROLE_SLAVE: &str = "slave";
pub const CONNECTED_SLAVES: &str = "connected_slaves";
pub const SENTINEL_IP: &str = "ip";
pub const SENTINEL_PORT: &str = "port";
pub const S_DOWN_TIME: &str = "s-down-time";

/// Parsed status of one member, fresh each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberObservation {
    /// Host name of the member, without port
    pub address: String,
    pub ordinal: usize,
    pub attributes: HashMap<String, String>,
}

impl MemberObservation {
    pub fn new(address: &str, ordinal: usize, attributes: HashMap<String, String>) -> Self {
        Self {
            address: address.to_string(),
            ordinal,
            attributes,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn role(&self) -> Option<&str> {
        self.get(ROLE)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role() == Some(role)
    }
}

/// Which status query the probe issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeQuery {
    /// `INFO replication` against replicated-set members
    Replication,
    /// `SENTINEL MASTERS` against sentinels
    SentinelMasters,
}

/// `key:value` lines split on the first `:`. Lines without one are dropped.
pub fn parse_replication_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.trim_end_matches('\r').split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Permissive scan of a `map[k:v ...]` listing. Everything up to and
/// including the first `map` token is discarded, brackets are stripped and
/// only `k:v` tokens with exactly one `:` are kept. When a key repeats the
/// first occurrence wins. `None` when there is no `map` token at all.
pub fn parse_masters_listing(text: &str) -> Option<HashMap<String, String>> {
    let start = text.find("map")?;
    let rest: String = text[start + 3..]
        .chars()
        .filter(|c| *c != '[' && *c != ']')
        .collect();

    let mut attributes = HashMap::new();
    for token in rest.split_whitespace() {
        let parts: Vec<&str> = token.split(':').collect();
        if let [key, value] = parts.as_slice() {
            attributes
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    Some(attributes)
}

pub fn count_role(observations: &[MemberObservation], role: &str) -> usize {
    observations.iter().filter(|o| o.has_role(role)).count()
}

#[derive(Clone)]
pub struct TopologyProbe {
    transport: Arc<dyn RedisTransport>,
}

impl TopologyProbe {
    pub fn new(transport: Arc<dyn RedisTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn RedisTransport> {
        &self.transport
    }

    /// Observe every endpoint concurrently, preserving ordinal order.
    #[instrument(skip(self, endpoints, settings), fields(members = endpoints.len()))]
    pub async fn observe(
        &self,
        endpoints: &[Endpoint],
        settings: &ConnectSettings,
        query: ProbeQuery,
    ) -> Result<Vec<MemberObservation>> {
        let results = join_all(
            endpoints
                .iter()
                .map(|endpoint| self.observe_one(endpoint, settings, query)),
        )
        .await;

        let mut observations = Vec::with_capacity(endpoints.len());
        for result in results {
            if let Some(observation) = result? {
                observations.push(observation);
            }
        }
        debug!(live = observations.len(), "probe complete");
        Ok(observations)
    }

    async fn observe_one(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectSettings,
        query: ProbeQuery,
    ) -> Result<Option<MemberObservation>> {
        let mut session = match self.transport.open(endpoint, settings).await {
            Ok(session) => session,
            Err(e) => {
                debug!(member = %endpoint, error = %e, "member unreachable, skipping");
                return Ok(None);
            }
        };
        if let Err(e) = session.ping().await {
            debug!(member = %endpoint, error = %e, "ping failed, skipping");
            return Ok(None);
        }

        let attributes = match query {
            ProbeQuery::Replication => parse_replication_info(&session.replication_info().await?),
            ProbeQuery::SentinelMasters => {
                let listing = session.sentinel_masters().await?;
                parse_masters_listing(&listing).ok_or_else(|| WardenError::MalformedReply {
                    address: endpoint.address(),
                    reason: "no map sequence in sentinel masters reply".into(),
                })?
            }
        };

        Ok(Some(MemberObservation::new(
            &endpoint.host,
            endpoint.ordinal,
            attributes,
        )))
    }
}
