//! A versioned, immutable view of the system's current membership.
//!
//! Replaced wholesale (never mutated in place) whenever a
//! reconfiguration commits, so that in-flight consensus instances
//! which captured an older `Peers` keep a stable, consistent view of
//! `n`/`f`/the leader schedule for the duration of their own
//! instance — only new instances pick up a reconfiguration.
//!
//! Grounded on the original system's peers-beacon component, which
//! likewise published discrete, versioned membership snapshots rather
//! than mutating a shared peer list in place.

use std::net::SocketAddr;

use crate::bft::collections::HashMap;
use crate::bft::communication::NodeId;
use crate::bft::crypto::signature::PublicKey;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// An immutable snapshot of the system's membership as of some view.
#[derive(Clone)]
pub struct Peers {
    version: SeqNo,
    addrs: HashMap<NodeId, SocketAddr>,
    keys: HashMap<NodeId, PublicKey>,
}

impl Peers {
    pub fn new(version: SeqNo, addrs: HashMap<NodeId, SocketAddr>, keys: HashMap<NodeId, PublicKey>) -> Self {
        Self { version, addrs, keys }
    }

    pub fn version(&self) -> SeqNo {
        self.version
    }

    /// Total number of replicas, `n`.
    pub fn n(&self) -> usize {
        self.addrs.len()
    }

    /// Maximum number of tolerated faulty replicas, `f = (n - 1) / 3`.
    pub fn f(&self) -> usize {
        (self.n() - 1) / 3
    }

    /// Honest-majority quorum size, `2*f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// The primary for `view`, determined by round-robin over the
    /// sorted member ids.
    pub fn primary(&self, view: SeqNo) -> NodeId {
        let mut ids: Vec<NodeId> = self.addrs.keys().copied().collect();
        ids.sort();
        let index = (view.into_i32().rem_euclid(ids.len() as i32)) as usize;
        ids[index]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.addrs.contains_key(&id)
    }

    pub fn address(&self, id: NodeId) -> Option<SocketAddr> {
        self.addrs.get(&id).copied()
    }

    pub fn public_key(&self, id: NodeId) -> Option<&PublicKey> {
        self.keys.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.addrs.keys().copied()
    }

    /// Returns a new `Peers` with `id` added, at the next version.
    pub fn with_added(&self, id: NodeId, addr: SocketAddr, key: PublicKey) -> Self {
        let mut addrs = self.addrs.clone();
        let mut keys = self.keys.clone();
        addrs.insert(id, addr);
        keys.insert(id, key);
        Self {
            version: self.version.next(),
            addrs,
            keys,
        }
    }

    /// Returns a new `Peers` with `id` removed, at the next version.
    pub fn with_removed(&self, id: NodeId) -> Self {
        let mut addrs = self.addrs.clone();
        let mut keys = self.keys.clone();
        addrs.remove(&id);
        keys.remove(&id);
        Self {
            version: self.version.next(),
            addrs,
            keys,
        }
    }
}

/// A source of the current (or a reconfigured) membership snapshot.
///
/// Exists as a trait so membership can be loaded from a static file in
/// the common case, or fetched from some external coordination service
/// in a deployment that has one.
pub trait PeersBeacon {
    fn load(&self) -> Result<Peers>;
    fn store(&self, peers: &Peers) -> Result<()>;
}

/// A `PeersBeacon` backed by a single TOML file on disk.
pub struct FilePeersBeacon {
    path: std::path::PathBuf,
}

impl FilePeersBeacon {
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PeersFile {
    version: u32,
    members: Vec<PeerEntry>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PeerEntry {
    id: u32,
    addr: SocketAddr,
    public_key: Vec<u8>,
}

impl PeersBeacon for FilePeersBeacon {
    fn load(&self) -> Result<Peers> {
        let contents = std::fs::read_to_string(&self.path).wrapped(ErrorKind::Configuration)?;
        let file: PeersFile = toml::from_str(&contents).wrapped(ErrorKind::Configuration)?;
        let mut addrs = crate::bft::collections::hash_map();
        let mut keys = crate::bft::collections::hash_map();
        for entry in file.members {
            let id = NodeId::from(entry.id);
            addrs.insert(id, entry.addr);
            keys.insert(id, PublicKey::from_bytes(&entry.public_key)?);
        }
        Ok(Peers::new(SeqNo::from(file.version), addrs, keys))
    }

    fn store(&self, peers: &Peers) -> Result<()> {
        let members = peers
            .addrs
            .iter()
            .map(|(id, addr)| PeerEntry {
                id: u32::from(*id),
                addr: *addr,
                public_key: peers
                    .keys
                    .get(id)
                    .map(|k| k.as_bytes().to_vec())
                    .unwrap_or_default(),
            })
            .collect();
        let file = PeersFile {
            version: peers.version().into_i32() as u32,
            members,
        };
        let contents = toml::to_string_pretty(&file).wrapped(ErrorKind::Configuration)?;
        std::fs::write(&self.path, contents).wrapped(ErrorKind::Configuration)
    }
}
