//! Durable, storage-backed tracking of PBFT evidence for a single
//! client request.
//!
//! Unlike a purely in-memory vote counter, an [`Operation`] persists
//! every prepare/commit vote it accepts as a separate storage entry
//! before considering it counted, and its `prepared`/`committed`
//! predicates are answered by *counting stored entries*, never by
//! trusting an in-memory tally. This is what lets a replica resume a
//! consensus instance exactly where it left off after a crash: the
//! predicate can be recomputed from what's actually on disk, rather
//! than from a counter that could have drifted out of sync with what
//! was really durable at the moment of the crash.
//!
//! Grounded on the original system's persistent operation store, which
//! used the same three-stage `prepare -> commit -> execute` state
//! machine backed by evidence keyed by `(sequence, request digest,
//! view)`.

use crate::bft::collections::HashSet;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;
use crate::bft::storage::typed::{escape, join_key, pad, Persistent};
use crate::bft::storage::Storage;

/// How often (in accepted sequence numbers) a checkpoint is taken, and
/// the operation log pruned up to that point.
pub const CHECKPOINT_PERIOD: u32 = 1000;

/// Default width of the acceptance window, as a multiple of
/// [`CHECKPOINT_PERIOD`]: a replica accepts pre-prepares up to
/// `low_water + DEFAULT_WATERMARK_MULTIPLIER * CHECKPOINT_PERIOD`, wide
/// enough that a slow replica still has room to prepare a full
/// checkpoint period's worth of sequences before the window it's
/// working in gets collected out from under it.
pub const DEFAULT_WATERMARK_MULTIPLIER: u32 = 2;

/// The stage an [`Operation`] has reached.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum Stage {
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

/// A single PBFT evidence ledger, keyed by `(sequence, request digest,
/// view)`, backed by durable storage.
///
/// Votes are appended as distinct keys under the operation's prefix;
/// `prepared`/`committed` range-count those keys rather than keep an
/// in-memory tally, so the answer survives a crash exactly as it was
/// before the crash.
pub struct Operation<'s> {
    storage: &'s dyn Storage,
    sequence: SeqNo,
    view: SeqNo,
    digest: Digest,
    prefix: Vec<u8>,
}

fn key_prefix(sequence: SeqNo, digest: &Digest, view: SeqNo) -> Vec<u8> {
    join_key(&[
        &pad(sequence.into_i32() as u64),
        &escape(&digest.to_string()),
        &pad(view.into_i32() as u64),
    ])
}

impl<'s> Operation<'s> {
    /// Opens (or creates) the evidence ledger for a request, identified
    /// by the triple `(sequence, digest, view)`.
    pub fn find_or_construct(
        storage: &'s dyn Storage,
        sequence: SeqNo,
        digest: Digest,
        view: SeqNo,
    ) -> Result<Self> {
        let prefix = key_prefix(sequence, &digest, view);
        let stage_key = stage_key(&prefix);
        if storage.read(&stage_key)?.is_none() {
            storage.create(&stage_key, stage_bytes(Stage::PrePrepared))?;
        }
        Ok(Self {
            storage,
            sequence,
            view,
            digest,
            prefix,
        })
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.sequence
    }

    pub fn view(&self) -> SeqNo {
        self.view
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Returns this operation's current stage, as last durably
    /// recorded.
    pub fn stage(&self) -> Result<Stage> {
        let bytes = self
            .storage
            .read(&stage_key(&self.prefix))?
            .ok_or_else(|| Error::simple(ErrorKind::Consensus))?;
        Ok(parse_stage(&bytes))
    }

    fn set_stage(&self, stage: Stage) -> Result<()> {
        self.storage.update(&stage_key(&self.prefix), stage_bytes(stage))
    }

    /// Records the pre-prepare envelope's sender (the primary), and
    /// saves the embedded request bytes alongside it. Idempotent: a
    /// retransmitted pre-prepare for the same `(view, sequence, hash)`
    /// is a no-op, satisfying (I-op-1) together with the fact that a
    /// different `h` for the same `(view, sequence)` opens a distinct
    /// `Operation` (see [`OperationManager::has_conflicting_preprepare`]).
    pub fn record_preprepare(&self, primary: NodeId, request: &[u8]) -> Result<()> {
        let key = preprepare_key(&self.prefix);
        if self.storage.read(&key)?.is_none() {
            self.storage.create(&key, &u32::from(primary).to_le_bytes())?;
        }
        self.save_request(request)
    }

    /// Whether a pre-prepare envelope has been recorded for this
    /// operation.
    pub fn is_preprepared(&self) -> Result<bool> {
        Ok(self.storage.read(&preprepare_key(&self.prefix))?.is_some())
    }

    /// Saves the request envelope bytes, if not already saved. Used
    /// both when a pre-prepare embeds the request, and when a replica
    /// supplies a request it originated locally (client intake).
    pub fn save_request(&self, request: &[u8]) -> Result<()> {
        let key = request_key(&self.prefix);
        if self.storage.read(&key)?.is_none() {
            self.storage.create(&key, request)?;
        }
        Ok(())
    }

    /// Whether this operation has a saved request envelope.
    pub fn has_request(&self) -> Result<bool> {
        Ok(self.storage.read(&request_key(&self.prefix))?.is_some())
    }

    /// Returns the saved request envelope bytes, if any, used to
    /// replay the request into execution after a crash-restart.
    pub fn request(&self) -> Result<Option<Vec<u8>>> {
        self.storage.read(&request_key(&self.prefix))
    }

    /// Records that `voter` cast a PREPARE vote for this operation.
    /// Idempotent: a repeated vote from the same replica is a no-op.
    pub fn record_prepare(&self, voter: NodeId) -> Result<()> {
        let key = vote_key(&self.prefix, "prepare", voter);
        if self.storage.read(&key)?.is_none() {
            self.storage.create(&key, &[])?;
        }
        Ok(())
    }

    /// Records that `voter` cast a COMMIT vote for this operation.
    pub fn record_commit(&self, voter: NodeId) -> Result<()> {
        let key = vote_key(&self.prefix, "commit", voter);
        if self.storage.read(&key)?.is_none() {
            self.storage.create(&key, &[])?;
        }
        Ok(())
    }

    /// Counts the distinct replicas that have cast a PREPARE vote, by
    /// range-scanning storage rather than trusting an in-memory tally.
    pub fn prepare_count(&self) -> Result<usize> {
        self.count_votes("prepare")
    }

    /// Counts the distinct replicas that have cast a COMMIT vote.
    pub fn commit_count(&self) -> Result<usize> {
        self.count_votes("commit")
    }

    /// The distinct replicas that have cast a PREPARE vote, recovered
    /// from the vote keys rather than an in-memory tally — used by the
    /// joint-consensus quorum test during a reconfiguration transition
    /// (spec.md §4.7), which needs the actual voter set rather than a
    /// single count.
    pub fn prepare_voters(&self) -> Result<Vec<NodeId>> {
        self.voters("prepare")
    }

    /// The distinct replicas that have cast a COMMIT vote.
    pub fn commit_voters(&self) -> Result<Vec<NodeId>> {
        self.voters("commit")
    }

    fn count_votes(&self, phase: &str) -> Result<usize> {
        let start = join_key(&[std::str::from_utf8(&self.prefix).unwrap(), phase, ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        Ok(self.storage.read_range(&start, &end)?.len())
    }

    fn voters(&self, phase: &str) -> Result<Vec<NodeId>> {
        let start = join_key(&[std::str::from_utf8(&self.prefix).unwrap(), phase, ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        let entries = self.storage.read_range(&start, &end)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| {
                let key = String::from_utf8(key).ok()?;
                let suffix = key.rsplit('_').next()?;
                suffix.parse::<u64>().ok().map(|n| NodeId::from(n as u32))
            })
            .collect())
    }

    /// Whether this operation is prepared: a pre-prepare envelope and
    /// its request are on file, and a quorum (`quorum` distinct voters)
    /// of PREPARE votes have been recorded. Transitions the durable
    /// stage to `Prepared` on first satisfaction.
    pub fn is_prepared(&self, quorum: usize) -> Result<bool> {
        let quorum_met = self.prepare_count()? >= quorum;
        self.evaluate_prepared(quorum_met)
    }

    /// Like [`Self::is_prepared`], but the quorum test is handed in
    /// already computed, so a caller mid reconfiguration-transition can
    /// require quorum in both the old and new configuration (spec.md
    /// §4.7) instead of a plain majority count.
    pub fn is_prepared_with(&self, quorum_met: bool) -> Result<bool> {
        self.evaluate_prepared(quorum_met)
    }

    fn evaluate_prepared(&self, quorum_met: bool) -> Result<bool> {
        if self.is_preprepared()? && self.has_request()? && quorum_met {
            if self.stage()? < Stage::Prepared {
                self.set_stage(Stage::Prepared)?;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether this operation is committed: prepared, plus a quorum of
    /// COMMIT votes. Transitions the durable stage to `Committed` on
    /// first satisfaction, and records this operation's `(view,
    /// digest)` under the sequence's committed-pointer key, so the
    /// engine can find which of possibly several operations opened for
    /// this sequence is the one to execute without having to guess.
    pub fn is_committed(&self, quorum: usize) -> Result<bool> {
        let prepared = self.is_prepared(quorum)?;
        let quorum_met = self.commit_count()? >= quorum;
        self.evaluate_committed(prepared, quorum_met)
    }

    /// Like [`Self::is_committed`], with both quorum tests handed in
    /// already computed (see [`Self::is_prepared_with`]).
    pub fn is_committed_with(&self, prepared: bool, quorum_met: bool) -> Result<bool> {
        self.evaluate_committed(prepared, quorum_met)
    }

    fn evaluate_committed(&self, prepared: bool, quorum_met: bool) -> Result<bool> {
        if prepared && quorum_met {
            if self.stage()? < Stage::Committed {
                self.set_stage(Stage::Committed)?;
                self.storage
                    .update(&committed_pointer_key(self.sequence), &committed_pointer_value(self.view, &self.digest))?;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads back the `(view, digest)` recorded as committed for
    /// `sequence`, if any operation opened for it has reached quorum.
    pub fn committed_pointer(storage: &'s dyn Storage, sequence: SeqNo) -> Result<Option<(SeqNo, Digest)>> {
        match storage.read(&committed_pointer_key(sequence))? {
            Some(bytes) => Ok(Some(parse_committed_pointer(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Marks this operation as executed. Idempotent.
    pub fn mark_executed(&self) -> Result<()> {
        self.set_stage(Stage::Executed)
    }
}

fn stage_key(prefix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(b"_stage");
    key
}

fn committed_pointer_key(sequence: SeqNo) -> Vec<u8> {
    join_key(&["committed", &pad(sequence.into_i32() as u64)])
}

fn committed_pointer_value(view: SeqNo, digest: &Digest) -> Vec<u8> {
    let mut out = (view.into_i32() as u64).to_le_bytes().to_vec();
    out.extend_from_slice(digest.as_ref());
    out
}

fn parse_committed_pointer(bytes: &[u8]) -> Result<(SeqNo, Digest)> {
    if bytes.len() != 8 + Digest::LENGTH {
        return Err("malformed committed pointer").simple(ErrorKind::Storage);
    }
    let mut view_bytes = [0u8; 8];
    view_bytes.copy_from_slice(&bytes[..8]);
    let view = SeqNo::from(u64::from_le_bytes(view_bytes) as u32);
    let digest = Digest::from_bytes(&bytes[8..])?;
    Ok((view, digest))
}

fn preprepare_key(prefix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(b"_preprepare");
    key
}

fn request_key(prefix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(b"_request");
    key
}

fn vote_key(prefix: &[u8], phase: &str, voter: NodeId) -> Vec<u8> {
    join_key(&[
        std::str::from_utf8(prefix).unwrap(),
        phase,
        &pad(u32::from(voter) as u64),
    ])
}

fn stage_bytes(stage: Stage) -> &'static [u8] {
    match stage {
        Stage::PrePrepared => b"0",
        Stage::Prepared => b"1",
        Stage::Committed => b"2",
        Stage::Executed => b"3",
    }
}

fn parse_stage(bytes: &[u8]) -> Stage {
    match bytes {
        b"0" => Stage::PrePrepared,
        b"1" => Stage::Prepared,
        b"2" => Stage::Committed,
        _ => Stage::Executed,
    }
}

/// Coordinates every in-flight [`Operation`] for this replica.
///
/// Tracks which sequence numbers have been garbage-collected (after a
/// stable checkpoint) so a late-arriving message for an already-pruned
/// sequence is rejected outright rather than resurrecting stale state.
pub struct OperationManager<'s> {
    storage: &'s dyn Storage,
    low_water_mark: Persistent<'s, u32>,
    high_water_mark: Persistent<'s, u32>,
    window: u32,
}

impl<'s> OperationManager<'s> {
    /// Opens the manager, rehydrating the low- and high-water marks
    /// from storage so a replica that crash-restarts after a
    /// checkpoint doesn't resurrect operations that checkpoint already
    /// superseded, and keeps accepting pre-prepares in the same window
    /// it was before the crash.
    ///
    /// `window` is the acceptance window's width, added to the
    /// low-water mark to derive the high-water mark the first time it
    /// is ever read; spec.md requires a configured multiple (default
    /// [`DEFAULT_WATERMARK_MULTIPLIER`]) of [`CHECKPOINT_PERIOD`].
    pub fn new(storage: &'s dyn Storage, window: u32) -> Self {
        Self {
            storage,
            low_water_mark: Persistent::open(storage, b"operations/low_water".to_vec()),
            high_water_mark: Persistent::open(storage, b"operations/high_water".to_vec()),
            window,
        }
    }

    /// The lowest sequence number not yet garbage-collected.
    pub fn low_water_mark(&self) -> Result<SeqNo> {
        Ok(SeqNo::from(self.low_water_mark.get_or(0)?))
    }

    /// The highest sequence number this replica currently accepts a
    /// pre-prepare for: `low_water_mark + window`.
    pub fn high_water_mark(&self) -> Result<SeqNo> {
        Ok(SeqNo::from(self.high_water_mark.get_or(self.window)?))
    }

    /// Opens or creates the evidence ledger for `(sequence, digest,
    /// view)`. Fails if `sequence` has already been garbage-collected.
    pub fn find_or_construct(
        &self,
        sequence: SeqNo,
        digest: Digest,
        view: SeqNo,
    ) -> Result<Operation<'s>> {
        if sequence < self.low_water_mark()? {
            return Err("sequence number has already been garbage collected")
                .wrapped(ErrorKind::SequenceOutOfWindow);
        }
        Operation::find_or_construct(self.storage, sequence, digest, view)
    }

    /// Whether some *other* digest already has a recorded pre-prepare
    /// for `sequence` under `view` — i.e. whether accepting a
    /// pre-prepare for `digest` would contradict one already on file
    /// for the same `(view, sequence)`. Enforces (I-op-1): a correct
    /// primary never pre-prepares two different requests under the
    /// same `(view, sequence)`.
    pub fn has_conflicting_preprepare(&self, sequence: SeqNo, view: SeqNo, digest: Digest) -> Result<bool> {
        let start = join_key(&[&pad(sequence.into_i32() as u64), ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        let own_prefix = key_prefix(sequence, &digest, view);
        for (key, _) in self.storage.read_range(&start, &end)? {
            if !key.ends_with(b"_preprepare") {
                continue;
            }
            if key.starts_with(&own_prefix) {
                continue;
            }
            let suffix = &key[..key.len() - b"_preprepare".len()];
            let parts: Vec<&str> = std::str::from_utf8(suffix).unwrap().splitn(3, '_').collect();
            if parts.len() < 3 {
                continue;
            }
            let other_view: u64 = parts[2].parse().unwrap_or(u64::MAX);
            if other_view == view.into_i32() as u64 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Finds the request envelope bytes already durably saved for
    /// `(sequence, digest)` under any view, regardless of which view's
    /// `Operation` first recorded it. Used to adopt a new-view's
    /// derived pre-prepares without needing the new primary to re-ship
    /// bytes a replica already durably holds from the view it was
    /// originally prepared under.
    pub fn recall_request(&self, sequence: SeqNo, digest: Digest) -> Result<Option<Vec<u8>>> {
        let start = join_key(&[&pad(sequence.into_i32() as u64), ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        let target = escape(&digest.to_string());
        for (key, value) in self.storage.read_range(&start, &end)? {
            if !key.ends_with(b"_request") {
                continue;
            }
            let suffix = &key[..key.len() - b"_request".len()];
            let parts: Vec<&str> = std::str::from_utf8(suffix).unwrap().splitn(3, '_').collect();
            if parts.len() < 2 {
                continue;
            }
            if parts[1] == target {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Deletes all evidence for sequence numbers up to (and including)
    /// `upto`, called once a checkpoint covering them becomes stable.
    pub fn delete_operations_until(&mut self, upto: SeqNo) -> Result<()> {
        let start = Vec::new();
        let end = join_key(&[&pad(upto.next().into_i32() as u64), ""]);
        self.storage.remove_range(&start, &end)?;
        let low = u32::from(upto.next());
        self.low_water_mark.set(&low)?;
        self.high_water_mark.set(&low.saturating_add(self.window))?;
        Ok(())
    }

    /// Returns the distinct `(sequence, view)` pairs with an operation
    /// in the `Prepared` stage or later, at `sequence >= since`, used
    /// to build a view-change's prepared-proof bundle. Where more than
    /// one view prepared the same sequence (shouldn't normally happen,
    /// but a Byzantine primary could try), the largest view wins.
    pub fn prepared_operations_since(&self, since: SeqNo) -> Result<Vec<(SeqNo, Digest, SeqNo)>> {
        let entries = self.storage.read_range(&join_key(&[&pad(since.into_i32() as u64), ""]), &[0xff])?;
        let mut best: crate::bft::collections::HashMap<(u64, String), (SeqNo, Digest, SeqNo)> =
            crate::bft::collections::hash_map();
        let mut seen: HashSet<Vec<u8>> = crate::bft::collections::hash_set();
        for (key, value) in entries {
            if !key.ends_with(b"_stage") {
                continue;
            }
            if parse_stage(&value) < Stage::Prepared {
                continue;
            }
            if !seen.insert(key.clone()) {
                continue;
            }
            let parts: Vec<&str> = std::str::from_utf8(&key).unwrap().splitn(3, '_').collect();
            if parts.len() < 3 {
                continue;
            }
            let seq: u64 = parts[0].parse().unwrap_or(0);
            let digest = match Digest::from_hex(parts[1]) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let view_part = parts[2].trim_end_matches("_stage");
            let view: u64 = view_part.parse().unwrap_or(0);
            let entry_key = (seq, parts[1].to_string());
            best.entry(entry_key)
                .and_modify(|(_, d, v)| {
                    if SeqNo::from(view as u32) > *v {
                        *v = SeqNo::from(view as u32);
                        *d = digest;
                    }
                })
                .or_insert((SeqNo::from(seq as u32), digest, SeqNo::from(view as u32)));
        }
        Ok(best.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::storage::mem::MemStorage;

    fn digest(byte: u8) -> Digest {
        Digest::from_bytes(&[byte; Digest::LENGTH]).unwrap()
    }

    #[test]
    fn prepare_quorum_is_computed_from_stored_votes() {
        let storage = MemStorage::new();
        let op = Operation::find_or_construct(&storage, SeqNo::from(1), digest(1), SeqNo::ZERO).unwrap();
        op.record_preprepare(NodeId::from(0), b"request bytes").unwrap();
        assert!(!op.is_prepared(3).unwrap());
        op.record_prepare(NodeId::from(0)).unwrap();
        op.record_prepare(NodeId::from(1)).unwrap();
        assert!(!op.is_prepared(3).unwrap());
        op.record_prepare(NodeId::from(2)).unwrap();
        assert!(op.is_prepared(3).unwrap());
        assert_eq!(op.stage().unwrap(), Stage::Prepared);
    }

    #[test]
    fn prepared_requires_preprepare_and_request() {
        let storage = MemStorage::new();
        let op = Operation::find_or_construct(&storage, SeqNo::from(1), digest(1), SeqNo::ZERO).unwrap();
        op.record_prepare(NodeId::from(0)).unwrap();
        op.record_prepare(NodeId::from(1)).unwrap();
        op.record_prepare(NodeId::from(2)).unwrap();
        assert!(!op.is_prepared(3).unwrap(), "votes alone are not enough without a pre-prepare");
        op.record_preprepare(NodeId::from(0), b"request bytes").unwrap();
        assert!(op.is_prepared(3).unwrap());
    }

    #[test]
    fn conflicting_preprepare_is_detected() {
        let storage = MemStorage::new();
        let mgr = OperationManager::new(&storage, CHECKPOINT_PERIOD * DEFAULT_WATERMARK_MULTIPLIER);
        let a = mgr.find_or_construct(SeqNo::from(1), digest(1), SeqNo::ZERO).unwrap();
        a.record_preprepare(NodeId::from(0), b"a").unwrap();
        assert!(!mgr.has_conflicting_preprepare(SeqNo::from(1), SeqNo::ZERO, digest(1)).unwrap());
        assert!(mgr.has_conflicting_preprepare(SeqNo::from(1), SeqNo::ZERO, digest(2)).unwrap());
    }

    #[test]
    fn duplicate_votes_are_not_double_counted() {
        let storage = MemStorage::new();
        let op = Operation::find_or_construct(&storage, SeqNo::from(1), digest(1), SeqNo::ZERO).unwrap();
        op.record_commit(NodeId::from(0)).unwrap();
        op.record_commit(NodeId::from(0)).unwrap();
        assert_eq!(op.commit_count().unwrap(), 1);
    }

    #[test]
    fn garbage_collected_sequence_is_rejected() {
        let storage = MemStorage::new();
        let mut mgr = OperationManager::new(&storage, CHECKPOINT_PERIOD * DEFAULT_WATERMARK_MULTIPLIER);
        mgr.find_or_construct(SeqNo::from(1), digest(1), SeqNo::ZERO).unwrap();
        mgr.delete_operations_until(SeqNo::from(1)).unwrap();
        assert!(mgr.find_or_construct(SeqNo::from(1), digest(1), SeqNo::ZERO).is_err());
        assert!(mgr.find_or_construct(SeqNo::from(2), digest(1), SeqNo::ZERO).is_ok());
    }
}
