//! Bootstraps the same 4-replica loopback swarm as `bootstrap-local`,
//! then drives a sequence of CRUD commands against it from a single
//! client `Node`, printing each reply as it arrives.

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
const BASE_PORT: u16 = 20150;

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

    Delay::new(Duration::from_millis(500)).await;

    let client_cfg = NodeConfig {
        f: (N as usize - 1) / 3,
        id: client_id,
        addrs: all_addrs,
        pk: all_pk,
        sk: client_key,
    };
    let mut client: Node<KvCommand> = Node::bootstrap(client_cfg).await.unwrap();

    let commands = vec![
        KvCommand::Create { key: b"hello".to_vec(), value: b"world".to_vec() },
        KvCommand::Read { key: b"hello".to_vec() },
        KvCommand::Update { key: b"hello".to_vec(), value: b"there".to_vec() },
        KvCommand::Delete { key: b"hello".to_vec() },
    ];

    for (i, command) in commands.into_iter().enumerate() {
        let req = RequestMessage::new(1, i as u64, RequestPayload::Database(command));
        let _ = client.send(&SystemMessage::Request(req), NodeId::from(0)).await;
        match tokio::time::timeout(Duration::from_secs(2), client.receive()).await {
            Ok(Ok(Message::System(header, SystemMessage::Reply(_)))) => {
                println!("request {i}: reply from replica {}", u32::from(header.from()));
            }
            _ => println!("request {i}: no reply within the timeout"),
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
    let state_dir = std::env::temp_dir().join(format!("swarm-pbft-client-demo-{}", u32::from(id)));
    let cfg = common::demo_config(listen_addr, state_dir);

    let mut replica = Replica::new(id, storage, peers, &cfg, node, timeouts, KvService, metrics)
        .expect("assembling a replica over fresh in-memory storage never fails");
    if let Err(e) = replica.run().await {
        eprintln!("replica {} halted: {}", u32::from(id), e);
    }
}
