//! Membership-change proposals, carried as ordinary client requests
//! through the same consensus pipeline as database operations so that
//! a reconfiguration is itself totally ordered with respect to every
//! other request (spec: dynamic reconfiguration protocol).
//!
//! Grounded on the original system's configuration-change commands,
//! which likewise rode through normal-case consensus rather than a
//! side channel.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use std::net::SocketAddr;

use crate::bft::communication::NodeId;
use crate::bft::crypto::signature::PublicKey;

/// A proposal to add or remove a replica from the system's
/// configuration.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy)]
pub enum ConfigChangeMsg {
    /// Adds `id`, reachable at `addr` with public key `key`, as a new
    /// replica.
    AddReplica {
        id: NodeId,
        addr: SocketAddr,
        key: PublicKey,
    },
    /// Removes `id` from the set of replicas.
    RemoveReplica { id: NodeId },
}

impl ConfigChangeMsg {
    pub fn target(&self) -> NodeId {
        match self {
            ConfigChangeMsg::AddReplica { id, .. } => *id,
            ConfigChangeMsg::RemoveReplica { id } => *id,
        }
    }
}
