//! The single-threaded replica actor (spec.md §5): owns every
//! consensus sub-component for one replica and is the only thing in
//! this crate that performs I/O with whatever an [`Effect`] hands back
//! to carry out. Every sub-component (`Engine`, `CheckpointManager`,
//! `Synchronizer`, `StateTransfer`, `Audit`) stays a pure state
//! machine; this module is where their effects actually get sent,
//! broadcast, armed or queued.

pub mod config_store;
pub mod peers;

use std::collections::VecDeque;
use std::time::Duration;

use crate::bft::audit::{Audit, AuditAlarm};
use crate::bft::collections::HashMap;
use crate::bft::communication::message::{
    AuditMessage, ConsensusMessageKind, CstMessage, Header, Message, ReplyMessage, RequestMessage,
    RequestPayload, StatusResponseMessage, SystemMessage, ViewChangeMessage,
};
use crate::bft::communication::serialize::SharedData;
use crate::bft::communication::{Node, NodeId};
use crate::bft::config::Config;
use crate::bft::consensus::engine::{ClientOutcome, Effect, Engine};
use crate::bft::core::config_store::ConfigStore;
use crate::bft::core::peers::Peers;
use crate::bft::crypto::hash::Digest;
use crate::bft::cst::checkpoint::{CheckpointEffect, CheckpointManager};
use crate::bft::cst::state_transfer::{StateTransfer, StateTransferEffect};
use crate::bft::error::*;
use crate::bft::executable::{Executor, ExecutorHandle, Reply, Request, Service, State, UpdateBatch};
use crate::bft::metrics::MetricsSink;
use crate::bft::ordering::SeqNo;
use crate::bft::storage::Storage;
use crate::bft::sync::{SyncEffect, Synchronizer};
use crate::bft::timeouts::{TimeoutKind, TimeoutsHandle};

/// How many distinct `(client, digest)` pairs the dedup window
/// remembers. `RequestMessage` doesn't carry a client-supplied
/// timestamp (see `DESIGN.md`), so staleness is judged against the
/// replica's own arrival clock rather than the client's.
const DEDUP_WINDOW: usize = 4096;
const DEDUP_HORIZON: Duration = Duration::from_secs(300);

fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Owns every durable sub-component of a single replica, and drives
/// them off the events `Node::receive` and the executor's result
/// channel hand back.
pub struct Replica<'s, S: Service> {
    id: NodeId,
    config: ConfigStore,
    engine: Engine<'s>,
    checkpoints: CheckpointManager<'s>,
    synchronizer: Synchronizer<'s>,
    state_transfer: StateTransfer,
    audit: Audit<'s>,
    node: Node<Request<S>>,
    timeouts: TimeoutsHandle<Request<S>>,
    executor: ExecutorHandle<S>,
    exec_rx: tokio::sync::mpsc::Receiver<crate::bft::executable::ExecutionResult<State<S>, Reply<S>>>,
    /// `attestant`/`digest` an armed `ScheduleStateTransfer` grace
    /// period is waiting on, keyed by the sequence it's for.
    pending_state_transfer: HashMap<SeqNo, (NodeId, Digest)>,
    /// Sequences a `queue_update_and_get_appstate` call is outstanding
    /// for, in request order, so the matching `RepliesAndAppstate`
    /// result (which doesn't itself carry a sequence number) can be
    /// attributed to the right checkpoint.
    pending_checkpoint_sequences: VecDeque<SeqNo>,
    /// Set to the sequence right after a reconfiguration's own
    /// execution while the joint-consensus transition window
    /// (spec.md §4.7) is open; closed once an operation at that
    /// sequence commits, which can only happen once a joint (old ∪
    /// new) quorum has seen the reconfiguration through to commit.
    pending_config_commit: Option<SeqNo>,
}

impl<'s, S> Replica<'s, S>
where
    S: Service + Send + 'static,
    Request<S>: Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static,
    State<S>: Send + Clone + 'static,
    Reply<S>: Send + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    /// Assembles a replica around an already-bootstrapped [`Node`] and
    /// a freshly spawned [`Executor`] for `service`.
    pub fn new(
        id: NodeId,
        storage: &'s dyn Storage,
        peers: Peers,
        cfg: &Config,
        node: Node<Request<S>>,
        timeouts: TimeoutsHandle<Request<S>>,
        service: S,
        metrics: &'s dyn MetricsSink,
    ) -> Result<Self> {
        let (executor, exec_rx) = Executor::new(service)?;
        let config = ConfigStore::new(peers);
        let engine = Engine::new(
            id,
            storage,
            cfg.checkpoint_interval,
            cfg.idle_timeout(),
            DEDUP_HORIZON,
            DEDUP_WINDOW,
            cfg.watermark_multiplier,
        );
        let checkpoints = CheckpointManager::new(id, storage, cfg.idle_timeout());
        let synchronizer = Synchronizer::new(id, storage);
        let audit = Audit::new(storage, cfg.audit_mem_size, metrics);

        Ok(Self {
            id,
            config,
            engine,
            checkpoints,
            synchronizer,
            state_transfer: StateTransfer::new(),
            audit,
            node,
            timeouts,
            executor,
            exec_rx,
            pending_state_transfer: crate::bft::collections::hash_map(),
            pending_checkpoint_sequences: VecDeque::new(),
            pending_config_commit: None,
        })
    }

    /// Re-arms whatever failure-detector deadline survives a
    /// crash-restart. Call once before [`Self::run`].
    pub fn recover(&mut self) -> Result<()> {
        if let Some(Effect::ArmFailureTimer(digest, after)) = self.engine.recover()? {
            self.timeouts.timeout(after, TimeoutKind::Request(digest));
        }
        Ok(())
    }

    /// A read-only snapshot of this replica's component state, for the
    /// status/audit component (spec.md §6 `status_request`/
    /// `status_response`).
    pub fn status(&self) -> Result<StatusResponseMessage> {
        Ok(StatusResponseMessage {
            view: self.engine.current_view()?,
            next_sequence: self.engine.next_sequence()?,
            next_execute: self.engine.next_execute()?,
            latest_local_checkpoint: self.checkpoints.latest_local()?,
            latest_stable_checkpoint: self.checkpoints.latest_stable()?,
        })
    }

    /// Drives this replica forever, or until a fatal error (storage
    /// that refuses to durably save accepted evidence) forces a halt
    /// (spec.md §7: `StorageNotSaved` is FATAL).
    pub async fn run(mut self) -> Result<()> {
        self.recover()?;
        loop {
            tokio::select! {
                msg = self.node.receive() => {
                    match msg {
                        Ok(msg) => self.dispatch(msg).await?,
                        Err(e) => tracing::debug!(error = %e, "failed to receive the next event"),
                    }
                }
                result = self.exec_rx.recv() => {
                    match result {
                        Some(result) => {
                            if let Err(e) = self.handle_execution_result(result).await {
                                if e.is_fatal() {
                                    return Err(e);
                                }
                                tracing::debug!(error = %e, "dropped execution result after handler error");
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: Message<Request<S>>) -> Result<()> {
        if let Err(e) = self.handle_message(msg).await {
            if e.is_fatal() {
                tracing::error!(error = %e, "fatal error, halting replica");
                return Err(e);
            }
            // view mismatch, out-of-window sequence, dedup/stale and
            // malformed-content errors are all normal during churn:
            // drop and carry on (spec.md §7).
            tracing::debug!(error = %e, "dropped message after handler error");
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: Message<Request<S>>) -> Result<()> {
        match msg {
            Message::System(header, message) => self.handle_system(header, message).await,
            Message::Timeout(kind) => self.handle_timeout(kind).await,
            Message::ConnectedTx(id, _) | Message::ConnectedRx(id, _) => {
                tracing::debug!(?id, "peer connection event");
                Ok(())
            }
            Message::Error(id, err) => {
                tracing::debug!(?id, error = %err, "communication error reported");
                Ok(())
            }
        }
    }

    async fn handle_system(&mut self, header: Header, message: SystemMessage<Request<S>>) -> Result<()> {
        match message {
            SystemMessage::Request(req) => self.handle_client_request(header.from(), req).await,
            SystemMessage::Reply(_) => {
                // this deployment never originates client requests from
                // a replica itself, so a reply has nowhere further to go.
                Ok(())
            }
            SystemMessage::Consensus(cm) => self.handle_consensus(header.from(), cm).await,
            SystemMessage::ViewChange(vm) => self.handle_view_change(header.from(), vm).await,
            SystemMessage::Cst(cst) => self.handle_cst(header.from(), cst).await,
            SystemMessage::StatusRequest(_) => {
                let status = self.status()?;
                let _ = self.node.send(&SystemMessage::StatusResponse(status), header.from()).await;
                Ok(())
            }
            SystemMessage::StatusResponse(_) => Ok(()),
            SystemMessage::Audit(msg) => {
                tracing::error!(from = ?header.from(), alarm = ?msg, "peer reported an audit alarm");
                Ok(())
            }
        }
    }

    async fn handle_client_request(&mut self, client: NodeId, req: RequestMessage<Request<S>>) -> Result<()> {
        let now = now_micros();
        let forward_copy = req.clone();
        let (outcome, effects) = self.engine.submit_client_request(&self.config, client, req, now, now)?;
        match outcome {
            ClientOutcome::Accepted { sequence } => {
                tracing::trace!(?sequence, "accepted client request as primary");
                let view = self.engine.current_view()?;
                if let Some(alarm) = self.audit.observe_primary(view, self.id)? {
                    self.raise_audit_alarm(alarm).await?;
                }
            }
            ClientOutcome::Forward { primary } => {
                let _ = self.node.send(&SystemMessage::Request(forward_copy), primary).await;
                return Ok(());
            }
            ClientOutcome::Duplicate => {
                tracing::debug!(?client, "rejected duplicate client request");
                return Ok(());
            }
            ClientOutcome::Stale => {
                tracing::debug!(?client, "rejected stale client request");
                return Ok(());
            }
        }
        self.carry_out_effects(effects).await
    }

    async fn handle_consensus(&mut self, sender: NodeId, cm: crate::bft::communication::message::ConsensusMessage) -> Result<()> {
        let (seq, view, kind) = cm.into_parts();
        let effects = match kind {
            ConsensusMessageKind::PrePrepare(digest, bytes) => {
                if let Some(alarm) = self.audit.observe_primary(view, sender)? {
                    self.raise_audit_alarm(alarm).await?;
                }
                self.engine.handle_preprepare(&self.config, sender, seq, view, digest, bytes)?
            }
            ConsensusMessageKind::Prepare(digest) => {
                self.engine.handle_prepare(&self.config, sender, seq, view, digest)?
            }
            ConsensusMessageKind::Commit(digest) => {
                self.engine.handle_commit(&self.config, sender, seq, view, digest)?
            }
        };
        self.carry_out_effects(effects).await
    }

    async fn handle_view_change(&mut self, sender: NodeId, vm: ViewChangeMessage) -> Result<()> {
        let mut effects: Vec<SyncEffect> = Vec::new();
        match &vm {
            ViewChangeMessage::StartViewChange { view } => {
                tracing::debug!(?sender, ?view, "peer suspects the current primary");
            }
            ViewChangeMessage::ViewChangeProof { view, .. } => {
                if self.synchronizer.validate_view_change(&self.config, sender, &vm)? {
                    self.synchronizer.record_view_change(*view, sender, &vm)?;
                    if self.config.current().primary(*view) == self.id
                        && self.synchronizer.has_quorum(&self.config, *view)?
                    {
                        if let Some(new_view) = self.synchronizer.build_new_view(&self.config, *view)? {
                            effects.push(SyncEffect::Broadcast(new_view));
                        }
                    }
                }
            }
            ViewChangeMessage::NewView { view, pre_prepares, .. } => {
                if self.synchronizer.validate_new_view(&self.config, &vm)? {
                    effects.push(SyncEffect::InstallNewView {
                        view: *view,
                        pre_prepares: pre_prepares.clone(),
                    });
                }
            }
        }
        self.carry_out_sync_effects(effects).await
    }

    async fn handle_cst(&mut self, sender: NodeId, msg: CstMessage) -> Result<()> {
        match msg {
            CstMessage::CheckpointDone { seq, digest } => {
                let effects = self.checkpoints.handle_checkpoint(&self.config, sender, seq, digest)?;
                self.carry_out_checkpoint_effects(effects).await?;
            }
            CstMessage::GetState { seq } => {
                let serves_this_seq = matches!(self.checkpoints.latest_stable()?, Some((stable, _)) if stable == seq);
                if serves_this_seq {
                    let rx = self.executor.export_state().simple(ErrorKind::Executable)?;
                    if let Ok((state, _digest)) = rx.await {
                        let mut buf = Vec::new();
                        if <S::Data as SharedData>::serialize_state(&mut buf, &state).is_ok() {
                            let reply = StateTransfer::build_reply(seq, buf);
                            let _ = self.node.send(&SystemMessage::Cst(reply), sender).await;
                        }
                    }
                }
            }
            CstMessage::SetState { seq, digest, state } => {
                if let Some(effect) = self.state_transfer.handle_set_state(sender, seq, digest, state) {
                    self.carry_out_state_transfer_effect(effect).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_timeout(&mut self, kind: TimeoutKind) -> Result<()> {
        match kind {
            TimeoutKind::Request(digest) => {
                if let Some(next_view) = self.engine.handle_failure_timeout(&digest)? {
                    tracing::info!(?next_view, "failure detector expired; beginning view change");
                    let vcm = self.synchronizer.begin_view_change(next_view, self.engine.operations(), &self.checkpoints)?;
                    let targets: Vec<NodeId> = self.config.current().ids().filter(|id| *id != self.id).collect();
                    self.node
                        .broadcast(&SystemMessage::ViewChange(ViewChangeMessage::StartViewChange { view: next_view }), targets.iter().copied())
                        .await;
                    self.node.broadcast(&SystemMessage::ViewChange(vcm), targets.into_iter()).await;
                }
            }
            TimeoutKind::Cst(sequence) => {
                if let Some((attestant, digest)) = self.pending_state_transfer.remove(&sequence) {
                    let still_behind = !matches!(self.checkpoints.latest_local()?, Some((local, _)) if local >= sequence);
                    if still_behind {
                        let effect = self.state_transfer.begin(attestant, sequence, digest);
                        self.carry_out_state_transfer_effect(effect).await?;
                    }
                }
            }
            TimeoutKind::ViewChange(view) => {
                tracing::debug!(?view, "view-change timeout fired; re-broadcasting suspicion");
                let targets: Vec<NodeId> = self.config.current().ids().filter(|id| *id != self.id).collect();
                self.node
                    .broadcast(&SystemMessage::ViewChange(ViewChangeMessage::StartViewChange { view }), targets.into_iter())
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_execution_result(
        &mut self,
        result: crate::bft::executable::ExecutionResult<State<S>, Reply<S>>,
    ) -> Result<()> {
        match result {
            crate::bft::executable::ExecutionResult::Replies(batch) => {
                self.deliver_replies(batch).await;
            }
            crate::bft::executable::ExecutionResult::RepliesAndAppstate(batch, _state, digest) => {
                self.deliver_replies(batch).await;
                if let Some(sequence) = self.pending_checkpoint_sequences.pop_front() {
                    let effects = self.checkpoints.record_local(&self.config, sequence, digest)?;
                    self.carry_out_checkpoint_effects(effects).await?;
                }
            }
        }
        Ok(())
    }

    async fn deliver_replies(&mut self, batch: crate::bft::executable::UpdateBatchReplies<Reply<S>>) {
        for reply in batch.into_inner() {
            let (to, digest, payload) = reply.into_inner();
            if to == self.id {
                // no known originating client: either forwarded to the
                // primary directly, or recovered through a view-change
                // replay with no session attached.
                continue;
            }
            let mut buf = Vec::new();
            if <S::Data as SharedData>::serialize_reply(&mut buf, &payload).is_err() {
                continue;
            }
            // `ReplyMessage` expects the client's own session/operation
            // id to match replies against outstanding requests, which
            // `ExecuteItem` doesn't carry past the client's digest; the
            // digest's leading bytes stand in until `RequestMessage`
            // carries enough context through execution to do better
            // (see `DESIGN.md`).
            let mut session_bytes = [0u8; 8];
            session_bytes.copy_from_slice(&digest.as_ref()[..8]);
            let session = u64::from_le_bytes(session_bytes);
            let reply_msg = ReplyMessage::new(session, 0, buf);
            let _ = self.node.send(&SystemMessage::Reply(reply_msg), to).await;
        }
    }

    async fn carry_out_effects(&mut self, effects: Vec<Effect<Request<S>>>) -> Result<()> {
        let mut pending_batch: UpdateBatch<Request<S>> = UpdateBatch::new();

        for effect in effects {
            match effect {
                Effect::Send(target, message) => {
                    let _ = self.node.send(&message, target).await;
                }
                Effect::Broadcast(targets, message) => {
                    self.node.broadcast(&message, targets.into_iter()).await;
                }
                Effect::ArmFailureTimer(digest, after) => {
                    self.timeouts.timeout(after, TimeoutKind::Request(digest));
                }
                Effect::DisarmFailureTimer => {
                    // a timer already in flight for a request that just
                    // got re-armed or executed fires harmlessly later:
                    // `Engine::handle_failure_timeout` recognizes it as
                    // stale via `FailureDetector::is_current_deadline`.
                }
                Effect::Execute(item) => {
                    if let Some(alarm) = self.audit.observe_commit(item.sequence, item.digest)? {
                        self.raise_audit_alarm(alarm).await?;
                    }
                    // Close the joint-consensus window once the first
                    // operation ordered after the reconfiguration itself
                    // commits: reaching that point requires the joint
                    // (old ∪ new) quorum to have already seen the
                    // reconfiguration through to commit, so every honest
                    // replica either already applied it or is about to
                    // (spec.md §4.7).
                    if self.config.is_transitioning() && self.pending_config_commit == Some(item.sequence) {
                        self.config.commit_transition();
                        self.pending_config_commit = None;
                    }
                    let payload: RequestPayload<Request<S>> = serde_json::from_slice(&item.request_bytes)
                        .wrapped(ErrorKind::CommunicationMessage)?;
                    match payload {
                        RequestPayload::Database(op) => {
                            let target = item.session.unwrap_or(self.id);
                            pending_batch.add(target, item.digest, op);
                        }
                        RequestPayload::Reconfiguration(change) => {
                            self.config.begin_transition(item.sequence, &change);
                            self.pending_config_commit = Some(item.sequence.next());
                        }
                    }
                }
                Effect::TriggerLocalCheckpoint(seq) => {
                    let batch = std::mem::replace(&mut pending_batch, UpdateBatch::new());
                    self.pending_checkpoint_sequences.push_back(seq);
                    self.executor
                        .queue_update_and_get_appstate(batch)
                        .simple(ErrorKind::Executable)?;
                }
            }
        }

        if !pending_batch.is_empty() {
            self.executor.queue_update(pending_batch).simple(ErrorKind::Executable)?;
        }
        Ok(())
    }

    async fn carry_out_checkpoint_effects(&mut self, effects: Vec<CheckpointEffect>) -> Result<()> {
        for effect in effects {
            match effect {
                CheckpointEffect::BroadcastCheckpointDone { sequence, digest } => {
                    let targets: Vec<NodeId> = self.config.current().ids().filter(|id| *id != self.id).collect();
                    self.node
                        .broadcast(&SystemMessage::Cst(CstMessage::CheckpointDone { seq: sequence, digest }), targets.into_iter())
                        .await;
                }
                CheckpointEffect::AdvanceLowWater(sequence) => {
                    self.engine.garbage_collect_until(sequence)?;
                }
                CheckpointEffect::ConsolidateService(_sequence) => {
                    // the executor already ran `consolidate_log` while
                    // building this checkpoint's appstate snapshot (see
                    // `Executor`'s `UpdateAndGetAppstate` branch).
                }
                CheckpointEffect::ScheduleStateTransfer { attestant, sequence, digest, grace } => {
                    self.pending_state_transfer.insert(sequence, (attestant, digest));
                    self.timeouts.timeout(grace, TimeoutKind::Cst(sequence));
                }
                CheckpointEffect::SafetyAlarm { sequence, local, stable } => {
                    tracing::error!(?sequence, ?local, ?stable, "checkpoint hash diverges from the honest-majority stable hash");
                }
            }
        }
        Ok(())
    }

    async fn carry_out_state_transfer_effect(&mut self, effect: StateTransferEffect) -> Result<()> {
        match effect {
            StateTransferEffect::Send(target, msg) => {
                let _ = self.node.send(&SystemMessage::Cst(msg), target).await;
            }
            StateTransferEffect::InstallSnapshot { sequence, digest, state } => {
                let decoded = <S::Data as SharedData>::deserialize_state(&state)
                    .wrapped(ErrorKind::CommunicationMessage)?;
                self.executor.install_state(decoded, Vec::new()).simple(ErrorKind::Executable)?;
                self.engine.fast_forward_to(sequence)?;
                let effects = self.checkpoints.record_local(&self.config, sequence, digest)?;
                self.carry_out_checkpoint_effects(effects).await?;
            }
            StateTransferEffect::Diverged { attestant, sequence, expected, got } => {
                tracing::error!(?attestant, ?sequence, ?expected, ?got, "state transfer snapshot diverged from declared hash");
                if let Some(retry) = self.checkpoints.pick_retry_attestant(attestant)? {
                    let retry_effect = self.state_transfer.retry(retry, sequence, expected);
                    if let StateTransferEffect::Send(target, msg) = retry_effect {
                        let _ = self.node.send(&SystemMessage::Cst(msg), target).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn carry_out_sync_effects(&mut self, effects: Vec<SyncEffect>) -> Result<()> {
        for effect in effects {
            match effect {
                SyncEffect::Broadcast(message) => {
                    let targets: Vec<NodeId> = self.config.current().ids().filter(|id| *id != self.id).collect();
                    self.node.broadcast(&SystemMessage::ViewChange(message), targets.into_iter()).await;
                }
                SyncEffect::InstallNewView { view, pre_prepares } => {
                    self.engine.install_new_view(view)?;
                    for (sequence, digest) in pre_prepares {
                        let effects = self.engine.adopt_new_view_preprepare(&self.config, view, sequence, digest)?;
                        self.carry_out_effects(effects).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn raise_audit_alarm(&mut self, alarm: AuditAlarm) -> Result<()> {
        tracing::error!(?alarm, "audit alarm raised");
        let message = AuditMessage::from(alarm);
        let targets: Vec<NodeId> = self.config.current().ids().filter(|id| *id != self.id).collect();
        self.node.broadcast(&SystemMessage::Audit(message), targets.into_iter()).await;
        Ok(())
    }
}
