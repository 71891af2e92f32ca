//! Checkpoint attestation accumulation and promotion to stable
//! (spec.md §4.5), grounded line-for-line on
//! `original_source/pbft/pbft_checkpoint_manager.cpp`'s
//! `maybe_stabilize_checkpoint`.
//!
//! Like [`Operation`](crate::bft::consensus::operation::Operation),
//! every attestation is durably recorded *before* the promotion
//! predicate is re-evaluated, so a crash between "accept evidence" and
//! "promote" just recomputes the same promotion on restart.

use std::time::Duration;

use rand::seq::IteratorRandom;

use crate::bft::collections::HashSet;
use crate::bft::communication::NodeId;
use crate::bft::core::config_store::ConfigStore;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;
use crate::bft::storage::typed::{escape, join_key, pad, Persistent};
use crate::bft::storage::Storage;

/// Something the caller must do as a result of feeding the manager a
/// checkpoint attestation.
pub enum CheckpointEffect {
    /// This replica just locally checkpointed through `sequence`;
    /// broadcast it as a `CheckpointDone` envelope (spec: "Handle this
    /// like an incoming checkpoint from self").
    BroadcastCheckpointDone { sequence: SeqNo, digest: Digest },
    /// A checkpoint at `sequence` just became stable: advance the
    /// operation manager's low-water mark and garbage-collect evidence
    /// up to it.
    AdvanceLowWater(SeqNo),
    /// Tell the service adapter to discard retained history strictly
    /// below `sequence`.
    ConsolidateService(SeqNo),
    /// This replica is behind the newly stable checkpoint: after a
    /// grace period, request its state from `attestant`.
    ScheduleStateTransfer {
        attestant: NodeId,
        sequence: SeqNo,
        digest: Digest,
        grace: Duration,
    },
    /// This replica's own local hash at `sequence` disagrees with the
    /// honest-majority stable hash: a safety violation.
    SafetyAlarm {
        sequence: SeqNo,
        local: Digest,
        stable: Digest,
    },
}

/// Tracks `latest_local` (highest sequence this replica has executed
/// through and hashed) and `latest_stable` (highest sequence with
/// honest-majority current-configuration attestation), per spec.md
/// §4.5.
pub struct CheckpointManager<'s> {
    storage: &'s dyn Storage,
    id: NodeId,
    latest_local: Persistent<'s, (u32, Digest)>,
    latest_stable: Persistent<'s, (u32, Digest)>,
    state_transfer_grace: Duration,
}

impl<'s> CheckpointManager<'s> {
    pub fn new(id: NodeId, storage: &'s dyn Storage, state_transfer_grace: Duration) -> Self {
        Self {
            storage,
            id,
            latest_local: Persistent::open(storage, b"ckpt/latest_local".to_vec()),
            latest_stable: Persistent::open(storage, b"ckpt/latest_stable".to_vec()),
            state_transfer_grace,
        }
    }

    pub fn latest_local(&self) -> Result<Option<(SeqNo, Digest)>> {
        Ok(self.latest_local.get()?.map(|(s, d)| (SeqNo::from(s), d)))
    }

    pub fn latest_stable(&self) -> Result<Option<(SeqNo, Digest)>> {
        Ok(self.latest_stable.get()?.map(|(s, d)| (SeqNo::from(s), d)))
    }

    /// Records that this replica has itself executed through and
    /// hashed `sequence` (spec: "Checkpoint triggering"), then feeds
    /// the same attestation through [`Self::handle_checkpoint`] as if
    /// it had arrived from a peer.
    pub fn record_local(
        &self,
        config: &ConfigStore,
        sequence: SeqNo,
        digest: Digest,
    ) -> Result<Vec<CheckpointEffect>> {
        let should_advance = !matches!(self.latest_local()?, Some((s, _)) if s >= sequence);
        if should_advance {
            self.latest_local.set(&(u32::from(sequence), digest))?;
        }
        let mut effects = vec![CheckpointEffect::BroadcastCheckpointDone { sequence, digest }];
        effects.extend(self.handle_checkpoint(config, self.id, sequence, digest)?);
        Ok(effects)
    }

    /// Processes an incoming (or self-originated) checkpoint envelope
    /// (spec.md §4.5, points 1-3).
    pub fn handle_checkpoint(
        &self,
        config: &ConfigStore,
        sender: NodeId,
        sequence: SeqNo,
        digest: Digest,
    ) -> Result<Vec<CheckpointEffect>> {
        if let Some((stable_seq, stable_digest)) = self.latest_stable()? {
            if sequence < stable_seq {
                return Ok(Vec::new());
            }
            if sequence == stable_seq {
                if digest == stable_digest {
                    self.record_stable_proof(sequence, digest, sender)?;
                }
                return Ok(Vec::new());
            }
        }

        self.record_partial(sequence, digest, sender)?;
        let attestants: HashSet<NodeId> = self
            .partial_attestants(sequence, digest)?
            .into_iter()
            .filter(|id| config.current().contains(*id))
            .collect();

        if attestants.len() < config.current().quorum() {
            return Ok(Vec::new());
        }

        self.promote_stable(config, sequence, digest, attestants)
    }

    fn promote_stable(
        &self,
        config: &ConfigStore,
        sequence: SeqNo,
        digest: Digest,
        attestants: HashSet<NodeId>,
    ) -> Result<Vec<CheckpointEffect>> {
        self.clear_stable_proofs()?;
        for id in &attestants {
            self.record_stable_proof(sequence, digest, *id)?;
        }
        self.latest_stable.set(&(u32::from(sequence), digest))?;
        self.gc_partials(sequence)?;

        let mut effects = vec![
            CheckpointEffect::AdvanceLowWater(sequence),
            CheckpointEffect::ConsolidateService(sequence),
        ];

        match self.latest_local()? {
            Some((local_seq, local_digest)) if local_seq == sequence && local_digest != digest => {
                effects.push(CheckpointEffect::SafetyAlarm {
                    sequence,
                    local: local_digest,
                    stable: digest,
                });
            }
            Some((local_seq, _)) if local_seq >= sequence => {}
            _ => {
                if let Some(attestant) = self.pick_attestant(&attestants, None) {
                    effects.push(CheckpointEffect::ScheduleStateTransfer {
                        attestant,
                        sequence,
                        digest,
                        grace: self.state_transfer_grace,
                    });
                }
            }
        }
        Ok(effects)
    }

    /// Picks a random attestant of the current stable checkpoint,
    /// other than `self` and `exclude` (used to retry against a
    /// different peer after a divergent `SET_STATE`, spec.md §4.5
    /// "State-transfer protocol").
    pub fn pick_retry_attestant(&self, exclude: NodeId) -> Result<Option<NodeId>> {
        let attestants: HashSet<NodeId> = self.stable_attestants()?.into_iter().collect();
        Ok(self.pick_attestant(&attestants, Some(exclude)))
    }

    fn pick_attestant(&self, attestants: &HashSet<NodeId>, exclude: Option<NodeId>) -> Option<NodeId> {
        attestants
            .iter()
            .copied()
            .filter(|id| *id != self.id && Some(*id) != exclude)
            .choose(&mut rand::thread_rng())
    }

    fn record_partial(&self, sequence: SeqNo, digest: Digest, sender: NodeId) -> Result<()> {
        let key = partial_key(sequence, digest, sender);
        if self.storage.read(&key)?.is_none() {
            self.storage.create(&key, &[])?;
        }
        Ok(())
    }

    fn partial_attestants(&self, sequence: SeqNo, digest: Digest) -> Result<Vec<NodeId>> {
        let (start, end) = partial_range(sequence, digest);
        let mut out = Vec::new();
        for (key, _) in self.storage.read_range(&start, &end)? {
            if let Some(id) = parse_trailing_node_id(&key) {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn gc_partials(&self, upto: SeqNo) -> Result<()> {
        let start = join_key(&["ckpt", "partial", ""]);
        let end = join_key(&["ckpt", "partial", &pad(u32::from(upto.next()) as u64), ""]);
        self.storage.remove_range(&start, &end)
    }

    fn record_stable_proof(&self, sequence: SeqNo, digest: Digest, sender: NodeId) -> Result<()> {
        let key = stable_proof_key(sender);
        let value = stable_proof_value(sequence, digest);
        if self.storage.read(&key)?.is_none() {
            self.storage.create(&key, &value)?;
        }
        Ok(())
    }

    fn clear_stable_proofs(&self) -> Result<()> {
        let start = join_key(&["ckpt", "stable_proof", ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        self.storage.remove_range(&start, &end)
    }

    /// Returns the senders that contributed to the current stable
    /// checkpoint's proof set.
    pub fn stable_attestants(&self) -> Result<Vec<NodeId>> {
        let start = join_key(&["ckpt", "stable_proof", ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        let mut out = Vec::new();
        for (key, _) in self.storage.read_range(&start, &end)? {
            if let Some(id) = parse_trailing_node_id(&key) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

fn partial_key(sequence: SeqNo, digest: Digest, sender: NodeId) -> Vec<u8> {
    join_key(&[
        "ckpt",
        "partial",
        &pad(u32::from(sequence) as u64),
        &escape(&digest.to_string()),
        &pad(u32::from(sender) as u64),
    ])
}

fn partial_range(sequence: SeqNo, digest: Digest) -> (Vec<u8>, Vec<u8>) {
    let start = join_key(&[
        "ckpt",
        "partial",
        &pad(u32::from(sequence) as u64),
        &escape(&digest.to_string()),
        "",
    ]);
    let mut end = start.clone();
    *end.last_mut().unwrap() = 0xff;
    (start, end)
}

fn stable_proof_key(sender: NodeId) -> Vec<u8> {
    join_key(&["ckpt", "stable_proof", &pad(u32::from(sender) as u64)])
}

fn stable_proof_value(sequence: SeqNo, digest: Digest) -> Vec<u8> {
    let mut out = (u32::from(sequence) as u64).to_le_bytes().to_vec();
    out.extend_from_slice(digest.as_ref());
    out
}

fn parse_trailing_node_id(key: &[u8]) -> Option<NodeId> {
    let text = std::str::from_utf8(key).ok()?;
    let last = text.rsplit('_').next()?;
    let raw: u32 = last.parse().ok()?;
    Some(NodeId::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::core::peers::Peers;
    use crate::bft::crypto::signature::KeyPair;
    use crate::bft::storage::mem::MemStorage;

    fn config_of(n: u32) -> ConfigStore {
        let mut addrs = crate::bft::collections::hash_map();
        let mut keys = crate::bft::collections::hash_map();
        for i in 0..n {
            addrs.insert(NodeId::from(i), "127.0.0.1:10000".parse().unwrap());
            keys.insert(NodeId::from(i), KeyPair::generate().unwrap().public_key());
        }
        ConfigStore::new(Peers::new(SeqNo::ZERO, addrs, keys))
    }

    fn digest(b: u8) -> Digest {
        Digest::from_bytes(&[b; Digest::LENGTH]).unwrap()
    }

    #[test]
    fn promotes_once_honest_majority_agrees() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mgr = CheckpointManager::new(NodeId::from(0), &storage, Duration::from_secs(1));

        let e1 = mgr.handle_checkpoint(&config, NodeId::from(0), SeqNo::from(100), digest(7)).unwrap();
        assert!(e1.is_empty());
        let e2 = mgr.handle_checkpoint(&config, NodeId::from(1), SeqNo::from(100), digest(7)).unwrap();
        assert!(e2.is_empty());
        let e3 = mgr.handle_checkpoint(&config, NodeId::from(2), SeqNo::from(100), digest(7)).unwrap();
        assert!(e3.iter().any(|e| matches!(e, CheckpointEffect::AdvanceLowWater(s) if *s == SeqNo::from(100))));
        assert_eq!(mgr.latest_stable().unwrap(), Some((SeqNo::from(100), digest(7))));
    }

    #[test]
    fn behind_replica_schedules_state_transfer() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mgr = CheckpointManager::new(NodeId::from(3), &storage, Duration::from_secs(1));

        mgr.handle_checkpoint(&config, NodeId::from(0), SeqNo::from(100), digest(7)).unwrap();
        mgr.handle_checkpoint(&config, NodeId::from(1), SeqNo::from(100), digest(7)).unwrap();
        let effects = mgr.handle_checkpoint(&config, NodeId::from(2), SeqNo::from(100), digest(7)).unwrap();

        assert!(effects
            .iter()
            .any(|e| matches!(e, CheckpointEffect::ScheduleStateTransfer { sequence, .. } if *sequence == SeqNo::from(100))));
    }

    #[test]
    fn divergent_local_hash_raises_safety_alarm() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mgr = CheckpointManager::new(NodeId::from(0), &storage, Duration::from_secs(1));

        // replica 0 locally computed a different hash at the same
        // sequence than the one the rest of the swarm agrees on.
        mgr.record_local(&config, SeqNo::from(100), digest(9)).unwrap();
        mgr.handle_checkpoint(&config, NodeId::from(1), SeqNo::from(100), digest(7)).unwrap();
        let effects = mgr.handle_checkpoint(&config, NodeId::from(2), SeqNo::from(100), digest(7)).unwrap();

        assert!(effects.iter().any(|e| matches!(e, CheckpointEffect::SafetyAlarm { .. })));
    }

    #[test]
    fn stale_checkpoint_below_stable_is_dropped() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mgr = CheckpointManager::new(NodeId::from(0), &storage, Duration::from_secs(1));
        mgr.handle_checkpoint(&config, NodeId::from(0), SeqNo::from(100), digest(7)).unwrap();
        mgr.handle_checkpoint(&config, NodeId::from(1), SeqNo::from(100), digest(7)).unwrap();
        mgr.handle_checkpoint(&config, NodeId::from(2), SeqNo::from(100), digest(7)).unwrap();

        let effects = mgr.handle_checkpoint(&config, NodeId::from(3), SeqNo::from(50), digest(1)).unwrap();
        assert!(effects.is_empty());
    }
}
