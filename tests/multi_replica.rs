//! Multi-replica happy-path scenario (spec.md §8), exercising four
//! independent `Engine` instances in-process: a client request is
//! accepted by the primary, relayed through pre-prepare/prepare/commit
//! to the other three replicas, and every replica ends up executing
//! the same operation at the same sequence.

use swarm_pbft::bft::collections::hash_map;
use swarm_pbft::bft::communication::message::{ConsensusMessageKind, RequestMessage, RequestPayload, SystemMessage};
use swarm_pbft::bft::communication::NodeId;
use swarm_pbft::bft::consensus::engine::{Effect, Engine};
use swarm_pbft::bft::core::config_store::ConfigStore;
use swarm_pbft::bft::core::peers::Peers;
use swarm_pbft::bft::crypto::signature::KeyPair;
use swarm_pbft::bft::ordering::SeqNo;
use swarm_pbft::bft::storage::mem::MemStorage;

fn config_of(n: u32) -> ConfigStore {
    let mut addrs = hash_map();
    let mut keys = hash_map();
    for i in 0..n {
        addrs.insert(NodeId::from(i), "127.0.0.1:10000".parse().unwrap());
        keys.insert(NodeId::from(i), KeyPair::generate().unwrap().public_key());
    }
    ConfigStore::new(Peers::new(SeqNo::ZERO, addrs, keys))
}

/// Drains a freshly produced batch of `Broadcast`/`Send` effects into
/// `(target, kind)` pairs, the way `core::Replica` would before handing
/// each one to `Node::send`/`Node::broadcast`. `PrePrepare` carries its
/// serialized request bytes, so this has to build one `kind` per
/// target rather than sharing a single clone.
fn outgoing_messages(sender: NodeId, effects: Vec<Effect<Vec<u8>>>) -> Vec<(NodeId, ConsensusMessageKind)> {
    let mut out = Vec::new();
    for effect in effects {
        match effect {
            Effect::Broadcast(targets, SystemMessage::Consensus(msg)) => {
                let (_, _, kind) = msg.into_parts();
                for target in targets {
                    assert_ne!(target, sender, "a replica never broadcasts to itself");
                    out.push((target, clone_kind(&kind)));
                }
            }
            Effect::Send(target, SystemMessage::Consensus(msg)) => {
                let (_, _, kind) = msg.into_parts();
                out.push((target, kind));
            }
            _ => {}
        }
    }
    out
}

fn clone_kind(kind: &ConsensusMessageKind) -> ConsensusMessageKind {
    match kind {
        ConsensusMessageKind::PrePrepare(digest, bytes) => ConsensusMessageKind::PrePrepare(*digest, bytes.clone()),
        ConsensusMessageKind::Prepare(digest) => ConsensusMessageKind::Prepare(*digest),
        ConsensusMessageKind::Commit(digest) => ConsensusMessageKind::Commit(*digest),
    }
}

#[test]
fn four_replicas_agree_on_and_execute_a_client_request() {
    let n = 4;
    let config = config_of(n);
    let storages: Vec<MemStorage> = (0..n).map(|_| MemStorage::new()).collect();
    let mut engines: Vec<Engine<'_>> = storages
        .iter()
        .enumerate()
        .map(|(i, storage)| {
            Engine::new(
                NodeId::from(i as u32),
                storage,
                1000,
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(60),
                1024,
                2,
            )
        })
        .collect();

    let request: RequestMessage<Vec<u8>> = RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));

    // the primary (replica 0) accepts the client's request directly.
    let (outcome, effects) = engines[0]
        .submit_client_request(&config, NodeId::from(9), request, 0, 0)
        .unwrap();
    assert!(matches!(
        outcome,
        swarm_pbft::bft::consensus::engine::ClientOutcome::Accepted { sequence } if sequence == SeqNo::ZERO
    ));

    // drive the resulting wire traffic to a fixed point: every replica
    // keeps processing whatever messages land in its inbox until none
    // are left to deliver, just as `core::Replica::run` would off a
    // real `Node`.
    let mut inboxes: Vec<Vec<(NodeId, ConsensusMessageKind)>> = vec![Vec::new(); n as usize];
    for (target, kind) in outgoing_messages(NodeId::from(0), effects) {
        inboxes[u32::from(target) as usize].push((NodeId::from(0), kind));
    }

    let mut pending = true;
    while pending {
        pending = false;
        for i in 0..n as usize {
            let inbox = std::mem::take(&mut inboxes[i]);
            if inbox.is_empty() {
                continue;
            }
            pending = true;
            for (sender, kind) in inbox {
                let effects = match kind {
                    ConsensusMessageKind::PrePrepare(digest, bytes) => engines[i]
                        .handle_preprepare::<Vec<u8>>(&config, sender, SeqNo::ZERO, SeqNo::ZERO, digest, bytes)
                        .unwrap(),
                    ConsensusMessageKind::Prepare(digest) => engines[i]
                        .handle_prepare::<Vec<u8>>(&config, sender, SeqNo::ZERO, SeqNo::ZERO, digest)
                        .unwrap(),
                    ConsensusMessageKind::Commit(digest) => engines[i]
                        .handle_commit::<Vec<u8>>(&config, sender, SeqNo::ZERO, SeqNo::ZERO, digest)
                        .unwrap(),
                };
                for (target, out_kind) in outgoing_messages(NodeId::from(i as u32), effects) {
                    inboxes[u32::from(target) as usize].push((NodeId::from(i as u32), out_kind));
                }
            }
        }
    }

    for (i, engine) in engines.iter().enumerate() {
        assert_eq!(
            engine.next_execute().unwrap(),
            SeqNo::from(1),
            "replica {i} never executed the agreed-upon request"
        );
    }
}

#[test]
fn a_lone_honest_replica_cannot_force_execution_without_a_quorum() {
    let config = config_of(4);
    let storage = MemStorage::new();
    let mut engine: Engine<'_> = Engine::new(
        NodeId::from(0),
        &storage,
        1000,
        std::time::Duration::from_secs(5),
        std::time::Duration::from_secs(60),
        1024,
        2,
    );
    let request: RequestMessage<Vec<u8>> = RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
    let (_, effects) = engine
        .submit_client_request(&config, NodeId::from(9), request, 0, 0)
        .unwrap();
    assert!(!effects.iter().any(|e| matches!(e, Effect::Execute(_))));
    assert_eq!(engine.next_execute().unwrap(), SeqNo::ZERO);
}
