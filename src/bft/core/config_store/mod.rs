//! Tracks the lifecycle of a single reconfiguration: from proposal,
//! through a joint-consensus transition period where a quorum must
//! agree in both the old and new configuration, to the point where
//! the new configuration alone governs.
//!
//! Grounded on the original system's configuration-change state
//! machine, which moved a pending change through the same
//! propose/transition/commit stages to avoid a window where two
//! disjoint quorums could each believe they were authoritative.

use crate::bft::communication::NodeId;
use crate::bft::consensus::reconfig::ConfigChangeMsg;
use crate::bft::core::peers::Peers;
use crate::bft::ordering::SeqNo;

/// The lifecycle stage of a reconfiguration.
#[derive(Debug, Clone)]
pub enum ConfigState {
    /// No reconfiguration is in progress; `Peers` is authoritative on
    /// its own.
    Stable,
    /// A reconfiguration committed at `at_sequence` is in its joint
    /// consensus window: a decision needs a quorum in both `old` and
    /// `new` before it counts.
    Transitioning {
        at_sequence: SeqNo,
        old: Peers,
        new: Peers,
    },
}

/// Holds the currently active membership and any in-progress
/// reconfiguration.
pub struct ConfigStore {
    current: Peers,
    state: ConfigState,
}

impl ConfigStore {
    pub fn new(initial: Peers) -> Self {
        Self {
            current: initial,
            state: ConfigState::Stable,
        }
    }

    pub fn current(&self) -> &Peers {
        &self.current
    }

    pub fn state(&self) -> &ConfigState {
        &self.state
    }

    /// Whether a decision needs a quorum of votes from `old` as well as
    /// from `new` to count, i.e. whether we're inside the joint
    /// consensus window of an in-progress reconfiguration.
    pub fn is_transitioning(&self) -> bool {
        matches!(self.state, ConfigState::Transitioning { .. })
    }

    /// Whether `votes` constitutes a quorum under the currently active
    /// configuration(s). During a transition, `votes` must separately
    /// meet quorum in both the old and the new configuration.
    pub fn has_quorum(&self, votes: &[NodeId]) -> bool {
        match &self.state {
            ConfigState::Stable => count_in(votes, &self.current) >= self.current.quorum(),
            ConfigState::Transitioning { old, new, .. } => {
                count_in(votes, old) >= old.quorum() && count_in(votes, new) >= new.quorum()
            }
        }
    }

    /// Begins the joint-consensus window for a reconfiguration decided
    /// at `at_sequence`.
    pub fn begin_transition(&mut self, at_sequence: SeqNo, change: &ConfigChangeMsg) {
        let new = match change {
            ConfigChangeMsg::AddReplica { id, addr, key } => {
                if self.current.contains(*id) {
                    self.current.clone()
                } else {
                    self.current.with_added(*id, *addr, *key)
                }
            }
            ConfigChangeMsg::RemoveReplica { id } => self.current.with_removed(*id),
        };
        self.state = ConfigState::Transitioning {
            at_sequence,
            old: self.current.clone(),
            new,
        };
    }

    /// Completes the transition, making the new configuration solely
    /// authoritative.
    pub fn commit_transition(&mut self) {
        if let ConfigState::Transitioning { new, .. } = &self.state {
            self.current = new.clone();
        }
        self.state = ConfigState::Stable;
    }
}

fn count_in(votes: &[NodeId], peers: &Peers) -> usize {
    votes.iter().filter(|id| peers.contains(**id)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::signature::KeyPair;

    fn peers_of(n: u32) -> Peers {
        let mut addrs = crate::bft::collections::hash_map();
        let mut keys = crate::bft::collections::hash_map();
        for i in 0..n {
            addrs.insert(NodeId::from(i), "127.0.0.1:10000".parse().unwrap());
            keys.insert(NodeId::from(i), KeyPair::generate().unwrap().public_key());
        }
        Peers::new(SeqNo::ZERO, addrs, keys)
    }

    #[test]
    fn transition_requires_quorum_in_both_configs() {
        let mut store = ConfigStore::new(peers_of(4));
        let change = ConfigChangeMsg::RemoveReplica { id: NodeId::from(3) };
        store.begin_transition(SeqNo::from(10), &change);
        assert!(store.is_transitioning());

        let votes: Vec<_> = (0..3).map(NodeId::from).collect();
        assert!(store.has_quorum(&votes));

        store.commit_transition();
        assert!(!store.is_transitioning());
        assert!(!store.current().contains(NodeId::from(3)));
    }
}
