//! The PBFT engine: primary selection, client request intake, and the
//! pre-prepare/prepare/commit/execute state machine.
//!
//! Modeled on the teacher's `Consensus<S>` (in what used to be
//! `bft/consensus/mod.rs`), generalized from a single-digest-per-sequence
//! batch protocol to one request per sequence number, and from an
//! in-memory `Log` to the durable [`OperationManager`](super::operation).
//!
//! The engine never touches a socket or a timer directly: every method
//! here is synchronous and returns the [`Effect`]s the caller (normally
//! `bft::core::Replica`) must carry out. This keeps the engine a pure,
//! crash-safe state machine — every `Effect` the caller needs to act on
//! is only returned *after* the evidence behind it is already durable,
//! so a caller that crashes after receiving an `Effect` but before
//! acting on it always recomputes the same `Effect` again on restart.

use serde::Serialize;

use crate::bft::communication::message::{
    ConsensusMessage, ConsensusMessageKind, RequestMessage, SystemMessage,
};
use crate::bft::communication::NodeId;
use crate::bft::consensus::failure_detector::{Arm, FailureDetector};
use crate::bft::consensus::operation::{OperationManager, Stage};
use crate::bft::core::config_store::ConfigStore;
use crate::bft::crypto::hash::{self, Digest};
use crate::bft::error::*;
use crate::bft::log::RequestLog;
use crate::bft::ordering::SeqNo;
use crate::bft::storage::typed::Persistent;
use crate::bft::storage::Storage;

/// Whether `sequence` falls inside the inclusive acceptance window
/// `[low_water, high_water]` (spec.md §3/§6: `low_water` is the first
/// live sequence, not the last checkpointed one, so the low end is
/// inclusive). Computed with wrapping arithmetic, independent of
/// [`SeqNo::index`]'s batch-protocol drop threshold, since the window
/// can legitimately be wider than that threshold allows.
fn in_window(low_water: SeqNo, high_water: SeqNo, sequence: SeqNo) -> bool {
    let lo = u32::from(low_water);
    let hi = u32::from(high_water);
    let s = u32::from(sequence);
    s.wrapping_sub(lo) <= hi.wrapping_sub(lo)
}

/// What happened to a client request submitted to [`Engine::submit_client_request`].
#[derive(Debug)]
pub enum ClientOutcome {
    /// Accepted locally, as primary, and assigned `sequence`.
    Accepted { sequence: SeqNo },
    /// This replica isn't the primary; the caller should forward the
    /// request on to it.
    Forward { primary: NodeId },
    /// Rejected: an identical request was already accepted within the
    /// dedup memory window.
    Duplicate,
    /// Rejected: the request's timestamp is older than the configured
    /// staleness horizon.
    Stale,
}

/// An executed operation, handed off to the service adapter.
pub struct ExecuteItem {
    pub sequence: SeqNo,
    pub digest: Digest,
    /// The serialized [`RequestPayload`], as it was accepted into
    /// consensus.
    pub request_bytes: Vec<u8>,
    /// The session to route the reply back to, if this replica ever
    /// saw the originating request directly.
    pub session: Option<NodeId>,
}

/// Something the caller must do as a result of feeding the engine an
/// event. Order within a returned `Vec<Effect<O>>` is significant: e.g.
/// an `ArmFailureTimer` always follows the `Broadcast`/`Send` whose
/// acceptance armed it.
pub enum Effect<O> {
    Send(NodeId, SystemMessage<O>),
    Broadcast(Vec<NodeId>, SystemMessage<O>),
    ArmFailureTimer(Digest, std::time::Duration),
    DisarmFailureTimer,
    Execute(ExecuteItem),
    /// Sequence `s` just executed and `s mod checkpoint_interval == 0`:
    /// ask the service adapter for `service_state_hash(s)` and feed the
    /// result back through the checkpoint manager.
    TriggerLocalCheckpoint(SeqNo),
}

/// The default per-request failure-detector timeout.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The durable core of the PBFT three-phase protocol for a single
/// replica.
pub struct Engine<'s> {
    id: NodeId,
    storage: &'s dyn Storage,
    view: Persistent<'s, u32>,
    view_valid: Persistent<'s, bool>,
    next_sequence: Persistent<'s, u32>,
    next_execute: Persistent<'s, u32>,
    checkpoint_interval: u32,
    request_timeout: std::time::Duration,
    dedup_horizon: std::time::Duration,
    operations: OperationManager<'s>,
    request_log: RequestLog,
    failure_detector: FailureDetector<'s>,
}

impl<'s> Engine<'s> {
    /// `watermark_multiplier` sizes the pre-prepare acceptance window
    /// as a multiple of `checkpoint_interval` (spec.md §3/§6/P5: a
    /// configured multiple, default
    /// [`DEFAULT_WATERMARK_MULTIPLIER`](crate::bft::consensus::operation::DEFAULT_WATERMARK_MULTIPLIER),
    /// of the checkpoint interval).
    pub fn new(
        id: NodeId,
        storage: &'s dyn Storage,
        checkpoint_interval: u32,
        request_timeout: std::time::Duration,
        dedup_horizon: std::time::Duration,
        dedup_window: usize,
        watermark_multiplier: u32,
    ) -> Self {
        Self {
            id,
            storage,
            view: Persistent::open(storage, b"engine/view".to_vec()),
            view_valid: Persistent::open(storage, b"engine/view_valid".to_vec()),
            next_sequence: Persistent::open(storage, b"engine/next_sequence".to_vec()),
            next_execute: Persistent::open(storage, b"engine/next_execute".to_vec()),
            checkpoint_interval,
            request_timeout,
            dedup_horizon,
            operations: OperationManager::new(storage, checkpoint_interval.saturating_mul(watermark_multiplier)),
            request_log: RequestLog::new(dedup_window),
            failure_detector: FailureDetector::new(storage, request_timeout),
        }
    }

    pub fn current_view(&self) -> Result<SeqNo> {
        Ok(SeqNo::from(self.view.get_or(0)?))
    }

    pub fn is_view_valid(&self) -> Result<bool> {
        self.view_valid.get_or(true)
    }

    pub fn next_sequence(&self) -> Result<SeqNo> {
        Ok(SeqNo::from(self.next_sequence.get_or(0)?))
    }

    pub fn next_execute(&self) -> Result<SeqNo> {
        Ok(SeqNo::from(self.next_execute.get_or(0)?))
    }

    pub fn primary(&self, config: &ConfigStore) -> NodeId {
        config.current().primary(self.current_view().unwrap_or(SeqNo::ZERO))
    }

    pub fn is_primary(&self, config: &ConfigStore) -> bool {
        self.primary(config) == self.id
    }

    /// Re-arms the failure detector from whatever deadline was last
    /// persisted, returning the `Effect` to schedule, if any. Call once
    /// at startup, after a crash-restart.
    pub fn recover(&self) -> Result<Option<Effect<()>>> {
        Ok(self
            .failure_detector
            .recover()?
            .map(|digest| Effect::ArmFailureTimer(digest, self.request_timeout)))
    }

    /// Client request intake (spec: "Client request intake").
    ///
    /// Signature/swarm-id verification is expected to already have
    /// happened at the wire layer (`Node::verify`) before this is
    /// called; this only handles dedup, staleness, forwarding and
    /// sequencing.
    pub fn submit_client_request<O>(
        &mut self,
        config: &ConfigStore,
        client: NodeId,
        request: RequestMessage<O>,
        timestamp_micros: i64,
        now_micros: i64,
    ) -> Result<(ClientOutcome, Vec<Effect<O>>)>
    where
        O: Clone + Serialize,
    {
        let bytes = serde_json::to_vec(request.payload()).wrapped(ErrorKind::CommunicationMessage)?;
        let digest = hash::digest(&bytes);

        if self.request_log.is_duplicate(client, digest) {
            return Ok((ClientOutcome::Duplicate, Vec::new()));
        }
        if self.request_log.is_stale(timestamp_micros, now_micros, self.dedup_horizon) {
            return Ok((ClientOutcome::Stale, Vec::new()));
        }

        let primary = self.primary(config);
        if primary != self.id {
            return Ok((ClientOutcome::Forward { primary }, Vec::new()));
        }

        let seq = self.next_sequence()?;
        self.next_sequence.set(&u32::from(seq.next()))?;
        let view = self.current_view()?;

        self.request_log.record_accepted(client, digest, timestamp_micros);
        self.request_log.remember_session(digest, client);

        let op = self.operations.find_or_construct(seq, digest, view)?;
        op.record_preprepare(self.id, &bytes)?;
        op.record_prepare(self.id)?;

        let mut effects = Vec::new();
        effects.push(Effect::Broadcast(
            config.current().ids().filter(|id| *id != self.id).collect(),
            SystemMessage::Consensus(ConsensusMessage::new(
                seq,
                view,
                ConsensusMessageKind::PrePrepare(digest, bytes),
            )),
        ));
        effects.push(Effect::Broadcast(
            config.current().ids().filter(|id| *id != self.id).collect(),
            SystemMessage::Consensus(ConsensusMessage::new(seq, view, ConsensusMessageKind::Prepare(digest))),
        ));
        match self.failure_detector.request_seen(digest)? {
            Arm::Schedule { digest, after } => effects.push(Effect::ArmFailureTimer(digest, after)),
            Arm::Unchanged => {}
            Arm::Disarm => effects.push(Effect::DisarmFailureTimer),
        }
        effects.extend(self.try_advance_execution()?);

        Ok((ClientOutcome::Accepted { sequence: seq }, effects))
    }

    /// Pre-prepare handling (spec: "Pre-prepare handling (non-primary)").
    pub fn handle_preprepare<O>(
        &mut self,
        config: &ConfigStore,
        sender: NodeId,
        seq: SeqNo,
        view: SeqNo,
        digest: Digest,
        request_bytes: Vec<u8>,
    ) -> Result<Vec<Effect<O>>> {
        if !self.is_view_valid()? || view != self.current_view()? {
            return Err("pre-prepare for a view other than the current one").simple(ErrorKind::ViewMismatch);
        }
        if sender != self.primary(config) {
            return Err("pre-prepare not from the current primary").simple(ErrorKind::Consensus);
        }
        if !in_window(self.operations.low_water_mark()?, self.operations.high_water_mark()?, seq) {
            return Err("pre-prepare sequence outside the acceptable window")
                .simple(ErrorKind::SequenceOutOfWindow);
        }
        if self.operations.has_conflicting_preprepare(seq, view, digest)? {
            return Err("pre-prepare conflicts with one already on file for (view, sequence)")
                .simple(ErrorKind::Consensus);
        }
        if hash::digest(&request_bytes) != digest {
            return Err("embedded request does not hash to the declared digest").simple(ErrorKind::Consensus);
        }

        let op = self.operations.find_or_construct(seq, digest, view)?;
        op.record_preprepare(sender, &request_bytes)?;
        op.record_prepare(self.id)?;

        let mut effects = vec![Effect::Broadcast(
            config.current().ids().filter(|id| *id != self.id).collect(),
            SystemMessage::Consensus(ConsensusMessage::new(seq, view, ConsensusMessageKind::Prepare(digest))),
        )];
        match self.failure_detector.request_seen(digest)? {
            Arm::Schedule { digest, after } => effects.push(Effect::ArmFailureTimer(digest, after)),
            Arm::Unchanged => {}
            Arm::Disarm => effects.push(Effect::DisarmFailureTimer),
        }
        effects.extend(self.try_advance_execution()?);
        Ok(effects)
    }

    /// Prepare handling (spec: "Prepare and commit handling").
    pub fn handle_prepare<O>(
        &mut self,
        config: &ConfigStore,
        sender: NodeId,
        seq: SeqNo,
        view: SeqNo,
        digest: Digest,
    ) -> Result<Vec<Effect<O>>> {
        if !self.is_view_valid()? || view != self.current_view()? {
            return Err("prepare for a view other than the current one").simple(ErrorKind::ViewMismatch);
        }
        let op = self.operations.find_or_construct(seq, digest, view)?;
        op.record_prepare(sender)?;

        let mut effects = Vec::new();
        let quorum_met = config.has_quorum(&op.prepare_voters()?);
        if op.is_prepared_with(quorum_met)? && op.stage()? == Stage::Prepared {
            op.record_commit(self.id)?;
            effects.push(Effect::Broadcast(
                config.current().ids().filter(|id| *id != self.id).collect(),
                SystemMessage::Consensus(ConsensusMessage::new(seq, view, ConsensusMessageKind::Commit(digest))),
            ));
        }
        effects.extend(self.try_advance_execution()?);
        Ok(effects)
    }

    /// Commit handling (spec: "Prepare and commit handling").
    pub fn handle_commit<O>(
        &mut self,
        config: &ConfigStore,
        sender: NodeId,
        seq: SeqNo,
        view: SeqNo,
        digest: Digest,
    ) -> Result<Vec<Effect<O>>> {
        if !self.is_view_valid()? || view != self.current_view()? {
            return Err("commit for a view other than the current one").simple(ErrorKind::ViewMismatch);
        }
        let op = self.operations.find_or_construct(seq, digest, view)?;
        op.record_commit(sender)?;
        let prepared = op.is_prepared_with(config.has_quorum(&op.prepare_voters()?))?;
        let committed = config.has_quorum(&op.commit_voters()?);
        op.is_committed_with(prepared, committed)?;
        self.try_advance_execution()
    }

    /// Execution (spec: "Execution"). Drains every contiguous,
    /// already-committed sequence starting at `next_execute`.
    fn try_advance_execution<O>(&mut self) -> Result<Vec<Effect<O>>> {
        let mut effects = Vec::new();
        loop {
            let next = self.next_execute()?;
            let (view, digest) = match crate::bft::consensus::operation::Operation::committed_pointer(self.storage, next)? {
                Some(pointer) => pointer,
                None => break,
            };
            let op = self.operations.find_or_construct(next, digest, view)?;
            let request_bytes = match op.request()? {
                Some(bytes) => bytes,
                None => break,
            };
            op.mark_executed()?;
            let session = self.request_log.take_session(&digest);
            effects.push(Effect::Execute(ExecuteItem {
                sequence: next,
                digest,
                request_bytes,
                session,
            }));
            match self.failure_detector.request_executed(&digest)? {
                Arm::Schedule { digest, after } => effects.push(Effect::ArmFailureTimer(digest, after)),
                Arm::Disarm => effects.push(Effect::DisarmFailureTimer),
                Arm::Unchanged => {}
            }
            self.next_execute.set(&u32::from(next.next()))?;
            if self.checkpoint_interval != 0 && u32::from(next) % self.checkpoint_interval == 0 {
                effects.push(Effect::TriggerLocalCheckpoint(next));
            }
        }
        Ok(effects)
    }

    /// The failure detector's deadline for `digest` expired (spec:
    /// "handle_failure"). Invalidates the current view so subsequent
    /// non-view-change traffic is dropped as stale, and reports the
    /// view that should now be proposed.
    pub fn handle_failure_timeout(&mut self, digest: &Digest) -> Result<Option<SeqNo>> {
        if !self.failure_detector.is_current_deadline(digest)? {
            return Ok(None);
        }
        self.view_valid.set(&false)?;
        Ok(Some(self.current_view()?.next()))
    }

    /// Installs `view` as current, called once the synchronizer has
    /// accepted a new-view. Marks the view valid again.
    pub fn install_new_view(&mut self, view: SeqNo) -> Result<()> {
        self.view.set(&u32::from(view))?;
        self.view_valid.set(&true)
    }

    /// Adopts one of a just-installed new-view's derived pre-prepares
    /// (spec.md §4.6 "install ... as if each had been received
    /// normally"). A null-op digest is accepted outright, since every
    /// replica derives the same sentinel bytes for it independently; a
    /// real digest is only adopted if this replica already durably
    /// holds the request bytes it points to (saved while the sequence
    /// was originally prepared, possibly under an earlier view) —
    /// otherwise it's left to arrive through ordinary pre-prepare
    /// traffic once the new primary resumes broadcasting.
    pub fn adopt_new_view_preprepare<O>(
        &mut self,
        config: &ConfigStore,
        view: SeqNo,
        sequence: SeqNo,
        digest: Digest,
    ) -> Result<Vec<Effect<O>>> {
        let primary = config.current().primary(view);
        let request_bytes = if digest == crate::bft::sync::null_op_digest() {
            crate::bft::sync::NULL_OP_REQUEST.to_vec()
        } else {
            match self.operations.recall_request(sequence, digest)? {
                Some(bytes) => bytes,
                None => return Ok(Vec::new()),
            }
        };

        let op = self.operations.find_or_construct(sequence, digest, view)?;
        op.record_preprepare(primary, &request_bytes)?;
        op.record_prepare(self.id)?;

        let mut effects = vec![Effect::Broadcast(
            config.current().ids().filter(|id| *id != self.id).collect(),
            SystemMessage::Consensus(ConsensusMessage::new(sequence, view, ConsensusMessageKind::Prepare(digest))),
        )];
        effects.extend(self.try_advance_execution()?);
        Ok(effects)
    }

    /// Discards operation evidence up to and including `sequence`, and
    /// advances the low-water mark past it. Called once the checkpoint
    /// manager promotes a checkpoint covering `sequence` to stable
    /// (spec: checkpoint promotion side-effects).
    pub fn garbage_collect_until(&mut self, sequence: SeqNo) -> Result<()> {
        self.operations.delete_operations_until(sequence)
    }

    /// The durable evidence store backing this engine, needed by the
    /// synchronizer to build a prepared-proof bundle for a view change.
    pub fn operations(&self) -> &OperationManager<'s> {
        &self.operations
    }

    /// Fast-forwards the sequencing cursors past `sequence` and
    /// discards evidence at or below it. Called once a state-transfer
    /// snapshot covering `sequence` has been installed, so the engine
    /// doesn't try to re-derive or re-execute anything the snapshot
    /// already reflects.
    pub fn fast_forward_to(&mut self, sequence: SeqNo) -> Result<()> {
        let next = sequence.next();
        if self.next_execute()? < next {
            self.next_execute.set(&u32::from(next))?;
        }
        if self.next_sequence()? < next {
            self.next_sequence.set(&u32::from(next))?;
        }
        self.garbage_collect_until(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::message::RequestPayload;
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

    #[test]
    fn primary_replica_assigns_sequence_and_executes_alone_is_not_enough() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mut engine: Engine<'_> = Engine::new(
            NodeId::from(0),
            &storage,
            1000,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(60),
            1024,
            2,
        );
        let request: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        let (outcome, effects) = engine
            .submit_client_request(&config, NodeId::from(9), request, 0, 0)
            .unwrap();
        assert!(matches!(outcome, ClientOutcome::Accepted { sequence } if sequence == SeqNo::from(0)));
        // a lone replica's own prepare/commit votes don't reach a
        // quorum of 3 in a 4-node config, so nothing executes yet.
        assert!(!effects.iter().any(|e| matches!(e, Effect::Execute(_))));
    }

    #[test]
    fn non_primary_forwards() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mut engine: Engine<'_> = Engine::new(
            NodeId::from(1),
            &storage,
            1000,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(60),
            1024,
            2,
        );
        let request: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        let (outcome, effects) = engine
            .submit_client_request(&config, NodeId::from(9), request, 0, 0)
            .unwrap();
        assert!(matches!(outcome, ClientOutcome::Forward { primary } if primary == NodeId::from(0)));
        assert!(effects.is_empty());
    }

    #[test]
    fn backup_accepts_preprepare_for_the_first_live_sequence() {
        // a fresh replica's low-water mark is `SeqNo::ZERO`, the same
        // sequence the primary assigns its very first client request;
        // a strict `seq > low_water` window check would reject it.
        let storage = MemStorage::new();
        let config = config_of(4);
        let mut engine: Engine<'_> = Engine::new(
            NodeId::from(1),
            &storage,
            1000,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(60),
            1024,
            2,
        );
        let request: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        let bytes = serde_json::to_vec(request.payload()).unwrap();
        let digest = hash::digest(&bytes);
        let effects = engine
            .handle_preprepare::<Vec<u8>>(&config, NodeId::from(0), SeqNo::ZERO, SeqNo::ZERO, digest, bytes)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Broadcast(_, SystemMessage::Consensus(cm)) if matches!(cm.kind(), ConsensusMessageKind::Prepare(_)))));
    }

    #[test]
    fn duplicate_request_is_rejected() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mut engine: Engine<'_> = Engine::new(
            NodeId::from(0),
            &storage,
            1000,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(60),
            1024,
            2,
        );
        let request: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        let request2: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        engine
            .submit_client_request(&config, NodeId::from(9), request, 0, 0)
            .unwrap();
        let (outcome, _) = engine
            .submit_client_request(&config, NodeId::from(9), request2, 1, 1)
            .unwrap();
        assert!(matches!(outcome, ClientOutcome::Duplicate));
    }

    #[test]
    fn full_quorum_of_votes_drives_execution() {
        let storage = MemStorage::new();
        let config = config_of(4);
        let mut engine: Engine<'_> = Engine::new(
            NodeId::from(0),
            &storage,
            1000,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(60),
            1024,
            2,
        );
        let request: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        let bytes = serde_json::to_vec(request.payload()).unwrap();
        let digest = hash::digest(&bytes);
        engine
            .submit_client_request::<Vec<u8>>(&config, NodeId::from(9), request, 0, 0)
            .unwrap();

        // two more prepares (replica 0's own vote was already recorded)
        // reach a quorum of 3.
        let effects = engine
            .handle_prepare::<Vec<u8>>(&config, NodeId::from(1), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects.is_empty());
        let effects = engine
            .handle_prepare::<Vec<u8>>(&config, NodeId::from(2), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects.iter().any(|e| matches!(e, Effect::Broadcast(_, SystemMessage::Consensus(cm)) if matches!(cm.kind(), ConsensusMessageKind::Commit(_)))));

        let effects = engine
            .handle_commit::<Vec<u8>>(&config, NodeId::from(1), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects.is_empty());
        let effects = engine
            .handle_commit::<Vec<u8>>(&config, NodeId::from(2), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects.iter().any(|e| matches!(e, Effect::Execute(item) if item.sequence == SeqNo::ZERO)));
        assert_eq!(engine.next_execute().unwrap(), SeqNo::from(1));
    }

    #[test]
    fn prepare_and_commit_require_joint_quorum_mid_transition() {
        use crate::bft::consensus::reconfig::ConfigChangeMsg;

        let storage = MemStorage::new();
        // `old` is a 4-node config (quorum 3); the reconfiguration
        // removes node 3, leaving `new` at 3 nodes (quorum 1). While
        // the transition window is open a decision needs quorum in
        // *both* (spec.md §4.7), not just whichever is smaller.
        let mut config = config_of(4);
        config.begin_transition(SeqNo::from(10), &ConfigChangeMsg::RemoveReplica { id: NodeId::from(3) });
        assert!(config.is_transitioning());

        let mut engine: Engine<'_> = Engine::new(
            NodeId::from(0),
            &storage,
            1000,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(60),
            1024,
            2,
        );
        let request: RequestMessage<Vec<u8>> =
            RequestMessage::new(1, 1, RequestPayload::Database(b"put k v".to_vec()));
        let bytes = serde_json::to_vec(request.payload()).unwrap();
        let digest = hash::digest(&bytes);
        engine
            .submit_client_request::<Vec<u8>>(&config, NodeId::from(9), request, 0, 0)
            .unwrap();

        // node 0's own prepare/commit votes (cast during submission)
        // are the only votes from `new` (node 3 is being removed and
        // never votes); a single vote from node 1, also in `new`, is
        // already enough to satisfy `new`'s quorum of 1, but `old`
        // still needs a quorum of 3 distinct voters.
        let effects = engine
            .handle_prepare::<Vec<u8>>(&config, NodeId::from(1), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(
            effects.is_empty(),
            "two prepares out of four old-config voters must not yet satisfy the old quorum of 3"
        );

        let effects = engine
            .handle_prepare::<Vec<u8>>(&config, NodeId::from(2), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(_, SystemMessage::Consensus(cm)) if matches!(cm.kind(), ConsensusMessageKind::Commit(_))
        )));

        let effects = engine
            .handle_commit::<Vec<u8>>(&config, NodeId::from(1), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects.is_empty());
        let effects = engine
            .handle_commit::<Vec<u8>>(&config, NodeId::from(2), SeqNo::ZERO, SeqNo::ZERO, digest)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Execute(item) if item.sequence == SeqNo::ZERO)));
    }
}
