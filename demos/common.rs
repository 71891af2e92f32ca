//! Shared scaffolding for the binaries in this directory: generating
//! throwaway keypairs, a loopback [`Peers`] snapshot over them, and a
//! minimal [`Config`] to drive a handful of in-process replicas.
//!
//! None of this belongs in the library itself — it exists only to
//! give the demos something concrete to bootstrap against, the same
//! way the teacher crate's own example binaries rolled their own
//! throwaway setup rather than depending on a real peers beacon or
//! key file on disk.

use std::net::SocketAddr;
use std::time::Duration;

use swarm_pbft::bft::collections::{hash_map, HashMap};
use swarm_pbft::bft::communication::NodeId;
use swarm_pbft::bft::config::{BootstrapSource, ChaosConfig, Config, CryptoToggles};
use swarm_pbft::bft::core::peers::Peers;
use swarm_pbft::bft::crypto::signature::{KeyPair, PublicKey};
use swarm_pbft::bft::ordering::SeqNo;

/// Generates `n` fresh Ed25519 keypairs, one per replica id `0..n`.
pub fn keypairs(n: u32) -> HashMap<NodeId, KeyPair> {
    let mut out = hash_map();
    for i in 0..n {
        out.insert(NodeId::from(i), KeyPair::generate().expect("ed25519 keygen"));
    }
    out
}

/// Loopback addresses `127.0.0.1:{base_port + i}` for replica ids `0..n`.
pub fn loopback_addrs(n: u32, base_port: u16) -> HashMap<NodeId, SocketAddr> {
    let mut out = hash_map();
    for i in 0..n {
        let addr: SocketAddr = format!("127.0.0.1:{}", base_port + i as u16).parse().unwrap();
        out.insert(NodeId::from(i), addr);
    }
    out
}

/// A `Peers` snapshot built from `keys`/`addrs` pairs produced by
/// [`keypairs`]/[`loopback_addrs`].
pub fn peers_of(keys: &HashMap<NodeId, KeyPair>, addrs: &HashMap<NodeId, SocketAddr>) -> Peers {
    let public_keys: HashMap<NodeId, PublicKey> = keys.iter().map(|(id, kp)| (*id, kp.public_key())).collect();
    Peers::new(SeqNo::ZERO, addrs.clone(), public_keys)
}

/// A throwaway [`Config`] for a replica listening at `listen_addr`,
/// short timeouts so the demo doesn't sit around.
pub fn demo_config(listen_addr: SocketAddr, state_dir: std::path::PathBuf) -> Config {
    Config {
        listen_addr,
        bootstrap: BootstrapSource::File { path: "/dev/null".into() },
        public_key_path: "/dev/null".into(),
        private_key_path: "/dev/null".into(),
        state_dir,
        idle_timeout_secs: 5,
        checkpoint_interval: 100,
        audit_mem_size: 1024,
        crypto: CryptoToggles::default(),
        monitor_addr: None,
        monitor_collate_interval_secs: 5,
        chaos: ChaosConfig::default(),
        peer_refresh_interval_secs: 30,
        watermark_multiplier: 2,
    }
}

pub const DEMO_DELAY: Duration = Duration::from_secs(3);
