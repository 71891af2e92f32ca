//! Bootstraps a single replica from a `peers.toml` membership file
//! through `FilePeersBeacon`, the way a real deployment's "bootstrap
//! source: file path" option (spec.md §6) would, rather than building
//! a `Peers` snapshot in-process the way `bootstrap-local` does.
//!
//! "cop" names the config-over-peers-file bootstrap path, as opposed
//! to `bootstrap-local`'s hardcoded loopback membership.

mod common;

use swarm_pbft::bft::communication::NodeId;
use swarm_pbft::bft::core::peers::{FilePeersBeacon, PeersBeacon};
use swarm_pbft::bft::crypto::signature::KeyPair;
use swarm_pbft::bft::{init, InitConfig};

const N: u32 = 4;
const BASE_PORT: u16 = 20300;

fn main() {
    let conf = InitConfig { async_threads: 2 };
    let _guard = unsafe { init(conf).unwrap() };

    let keys = common::keypairs(N);
    let addrs = common::loopback_addrs(N, BASE_PORT);
    let peers = common::peers_of(&keys, &addrs);

    let path = std::env::temp_dir().join("swarm-pbft-demo-peers.toml");
    let beacon = FilePeersBeacon::new(path.clone());
    beacon.store(&peers).expect("writing the demo peers file");
    println!("wrote {} peers to {}", peers.n(), path.display());

    let loaded = beacon.load().expect("reading back the demo peers file");
    assert_eq!(loaded.n(), peers.n());
    println!("loaded {} peers back from disk, version {:?}", loaded.n(), loaded.version());

    for id in NodeId::targets(0..N) {
        let addr = loaded.address(id).expect("every written id round-trips an address");
        let _: &KeyPair = keys.get(&id).expect("every written id has a matching local keypair");
        println!("replica {}: {}", u32::from(id), addr);
    }

    let _ = std::fs::remove_file(&path);
}
