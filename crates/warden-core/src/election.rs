//! Primary election
//!
//! Pure decision procedures over member observations. Neither procedure
//! performs I/O and neither ever guesses: anything short of a clear answer
//! comes back as an abstaining [`ElectionDecision`].

use crate::errors::{Result, WardenError};
use crate::probe::{
    MemberObservation, CONNECTED_SLAVES, ROLE_MASTER, ROLE_SLAVE, SENTINEL_IP, S_DOWN_TIME,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionDecision {
    pub candidate: Option<String>,
    /// `false` means leave the topology alone this tick
    pub certain: bool,
}

impl ElectionDecision {
    pub fn abstain() -> Self {
        Self {
            candidate: None,
            certain: false,
        }
    }

    pub fn elect(address: &str) -> Self {
        Self {
            candidate: Some(address.to_string()),
            certain: true,
        }
    }

    /// The candidate, only when the decision is certain.
    pub fn winner(&self) -> Option<&str> {
        if self.certain {
            self.candidate.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub masters: usize,
    pub slaves: usize,
}

impl RoleCounts {
    pub fn of(observations: &[MemberObservation]) -> Self {
        observations
            .iter()
            .fold(RoleCounts::default(), |mut counts, o| {
                if o.has_role(ROLE_MASTER) {
                    counts.masters += 1;
                } else if o.has_role(ROLE_SLAVE) {
                    counts.slaves += 1;
                }
                counts
            })
    }

    /// Exactly one member claims to be primary.
    pub fn is_steady(&self) -> bool {
        self.masters == 1
    }
}

/// Decide from replication status alone.
///
/// Steady state abstains. With no secondaries at all the first observed
/// member is promoted. Otherwise the member with the strictly highest
/// `connected_slaves` wins; a tie at the running maximum blanks the
/// candidate but keeps the maximum, so a later strictly higher count can
/// still win.
pub fn elect_without_sentinel(observations: &[MemberObservation]) -> Result<ElectionDecision> {
    let Some(first) = observations.first() else {
        return Ok(ElectionDecision::abstain());
    };

    let counts = RoleCounts::of(observations);
    if counts.is_steady() {
        return Ok(ElectionDecision::abstain());
    }
    if counts.slaves == 0 {
        return Ok(ElectionDecision::elect(&first.address));
    }

    let mut best_count: u64 = 0;
    let mut best_address: Option<&str> = None;
    for observation in observations {
        let Some(raw) = observation.get(CONNECTED_SLAVES) else {
            continue;
        };
        let count: u64 = raw.trim().parse().map_err(|_| WardenError::MalformedReply {
            address: observation.address.clone(),
            reason: format!("{} is not a count: {:?}", CONNECTED_SLAVES, raw),
        })?;

        if count > best_count {
            best_count = count;
            best_address = Some(observation.address.as_str());
        } else if count == best_count {
            best_address = None;
        }
    }

    Ok(match best_address {
        Some(address) => ElectionDecision::elect(address),
        None => ElectionDecision::abstain(),
    })
}

/// Decide from the Sentinels' views. Views carrying `s-down-time` are
/// ignored; the first `ip` whose agreement reaches `quorum`, in order of
/// first appearance, wins.
pub fn elect_with_sentinels(views: &[MemberObservation], quorum: u32) -> ElectionDecision {
    let mut tally: Vec<(&str, u32)> = Vec::new();

    for view in views {
        if view.get(S_DOWN_TIME).is_some() {
            continue;
        }
        let Some(ip) = view.get(SENTINEL_IP) else {
            continue;
        };
        match tally.iter_mut().find(|(candidate, _)| *candidate == ip) {
            Some((_, agreed)) => *agreed += 1,
            None => tally.push((ip, 1)),
        }
    }

    tally
        .into_iter()
        .find(|(_, agreed)| *agreed >= quorum)
        .map(|(ip, _)| ElectionDecision::elect(ip))
        .unwrap_or_else(ElectionDecision::abstain)
}
