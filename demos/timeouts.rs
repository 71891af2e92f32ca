//! Demonstrates `TimeoutsHandle`/`Message::Timeout` in isolation: a
//! lone `Node` arms a view-change timeout against its own event
//! queue and waits for it to fire, the way `core::Replica` relies on
//! the same mechanism to notice a dead primary (spec.md §4.4
//! "handle_failure").

mod common;

use std::time::Duration;

use swarm_pbft::bft::communication::message::Message;
use swarm_pbft::bft::communication::{Node, NodeConfig};
use swarm_pbft::bft::executable::kv_demo::KvCommand;
use swarm_pbft::bft::ordering::SeqNo;
use swarm_pbft::bft::timeouts::TimeoutKind;
use swarm_pbft::bft::{init, InitConfig};

fn main() {
    let conf = InitConfig { async_threads: 2 };
    let _guard = unsafe { init(conf).unwrap() };
    swarm_pbft::bft::async_runtime::block_on(async_main());
}

async fn async_main() {
    let keys = common::keypairs(1);
    let addrs = common::loopback_addrs(1, 20200);
    let pk = keys.iter().map(|(id, kp)| (*id, kp.public_key())).collect();
    let (_, sk) = keys.into_iter().next().unwrap();

    let cfg = NodeConfig {
        f: 0,
        id: addrs.keys().copied().next().unwrap(),
        addrs: addrs.clone(),
        pk,
        sk,
    };
    let node: Node<KvCommand> = Node::bootstrap(cfg).await.unwrap();
    let timeouts = node.timeouts_handle();

    println!("arming a 500ms view-change timeout for view 1");
    timeouts.timeout(Duration::from_millis(500), TimeoutKind::ViewChange(SeqNo::from(1u32)));

    let mut node = node;
    match node.receive().await {
        Ok(Message::Timeout(TimeoutKind::ViewChange(view))) => {
            println!("timeout fired for view {}", view.into_i32());
        }
        Ok(_) => println!("an unrelated event arrived first"),
        Err(e) => println!("node event queue closed: {e}"),
    }
}
