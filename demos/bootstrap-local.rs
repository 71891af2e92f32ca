//! Bootstraps a 4-replica swarm on loopback, submits one client
//! request through replica 0, and prints every reply it gets back.
//!
//! Mirrors the shape of the teacher crate's own example binaries
//! (bring up a handful of `Node`s on localhost, broadcast something,
//! print what comes back) generalized to this crate's actual
//! `core::Replica`/`Service` types instead of the teacher's.

mod common;

use std::time::Duration;

use futures_timer::Delay;

use swarm_pbft::bft::communication::message::{Message, RequestMessage, RequestPayload, SystemMessage};
use swarm_pbft::bft::communication::{Node, NodeConfig, NodeId};
use swarm_pbft::bft::core::peers::Peers;
use swarm_pbft::bft::core::Replica;
use swarm_pbft::bft::crypto::signature::KeyPair;
use swarm_pbft::bft::executable::kv_demo::{KvCommand, KvService};
use swarm_pbft::bft::metrics::NoopMetricsSink;
use swarm_pbft::bft::storage::mem::MemStorage;
use swarm_pbft::bft::{init, InitConfig};

const N: u32 = 4;
const BASE_PORT: u16 = 20100;

fn main() {
    let conf = InitConfig {
        async_threads: num_cpus::get(),
    };
    let _guard = unsafe { init(conf).unwrap() };
    swarm_pbft::bft::async_runtime::block_on(async_main());
}

async fn async_main() {
    let replica_keys = common::keypairs(N);
    let client_id = NodeId::from(N);
    let client_key = KeyPair::generate().unwrap();

    // every node (replica or client) needs the whole swarm's addresses
    // and public keys up front, so a replica can dial the client back
    // with a reply even though the client never joins `Peers` itself.
    let mut all_addrs = common::loopback_addrs(N, BASE_PORT);
    all_addrs.insert(client_id, format!("127.0.0.1:{}", BASE_PORT + N as u16).parse().unwrap());
    let mut all_pk: swarm_pbft::bft::collections::HashMap<_, _> =
        replica_keys.iter().map(|(id, kp)| (*id, kp.public_key())).collect();
    all_pk.insert(client_id, client_key.public_key());

    let peers = common::peers_of(&replica_keys, &common::loopback_addrs(N, BASE_PORT));

    for (id, sk) in replica_keys {
        let node_cfg = NodeConfig {
            f: (N as usize - 1) / 3,
            id,
            addrs: all_addrs.clone(),
            pk: all_pk.clone(),
            sk,
        };
        let peers = peers.clone();
        swarm_pbft::bft::async_runtime::spawn(async move {
            run_replica(id, node_cfg, peers).await;
        });
    }

    // give every replica a moment to finish connecting to its peers
    // before anyone tries to send it something.
    Delay::new(Duration::from_millis(500)).await;

    let client_cfg = NodeConfig {
        f: (N as usize - 1) / 3,
        id: client_id,
        addrs: all_addrs,
        pk: all_pk,
        sk: client_key,
    };
    let mut client: Node<KvCommand> = Node::bootstrap(client_cfg).await.unwrap();

    let req = RequestMessage::new(
        1,
        1,
        RequestPayload::Database(KvCommand::Create { key: b"k1".to_vec(), value: b"v1".to_vec() }),
    );
    println!("client: submitting CREATE(k1, v1) to replica 0");
    let _ = client.send(&SystemMessage::Request(req), NodeId::from(0)).await;

    for _ in 0..N {
        let received = tokio::time::timeout(Duration::from_secs(2), client.receive()).await;
        match received {
            Ok(Ok(Message::System(header, SystemMessage::Reply(_)))) => {
                println!("client: got a reply from replica {}", u32::from(header.from()));
            }
            Ok(Ok(_)) => {}
            _ => {
                println!("client: timed out waiting for a reply");
                break;
            }
        }
    }
}

async fn run_replica(id: NodeId, node_cfg: NodeConfig, peers: Peers) {
    let storage: &'static MemStorage = Box::leak(Box::new(MemStorage::new()));
    let metrics: &'static NoopMetricsSink = Box::leak(Box::new(NoopMetricsSink));
    let listen_addr = peers.address(id).expect("every bootstrapped id has an address");

    let node: Node<KvCommand> = match Node::bootstrap(node_cfg).await {
        Ok(n) => n,
        Err(e) => {
            eprintln!("replica {} failed to bootstrap: {}", u32::from(id), e);
            return;
        }
    };
    let timeouts = node.timeouts_handle();
    let state_dir = std::env::temp_dir().join(format!("swarm-pbft-demo-{}", u32::from(id)));
    let cfg = common::demo_config(listen_addr, state_dir);

    let mut replica = Replica::new(id, storage, peers, &cfg, node, timeouts, KvService, metrics)
        .expect("assembling a replica over fresh in-memory storage never fails");
    println!("replica {}: bootstrapped, entering the event loop", u32::from(id));
    if let Err(e) = replica.run().await {
        eprintln!("replica {} halted: {}", u32::from(id), e);
    }
}
