//! The request log: deduplication memory and the transient map from a
//! request digest back to the session that should receive its reply.
//!
//! Unlike [`crate::bft::consensus::operation`], nothing here is durable.
//! A crash loses the dedup memory and the session map, which is safe:
//! dedup is an optimization (the real safety net is that a request can
//! only ever be accepted into a single operation's pre-prepare, per
//! `(client, nonce, hash)`), and a lost session simply means the client
//! times out and retries, discovering its request already executed.
//!
//! Grounded on the original system's request deduplication memory,
//! which was likewise a bounded, process-local cache rather than a
//! durable table.

use std::time::Duration;

use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;

/// How many distinct `(client, digest)` pairs the dedup window
/// remembers before evicting the oldest. Spec's Open Question (a):
/// a duplicate arriving after eviction is conservatively treated as
/// new, relying on `(client, nonce, hash)` pre-prepare uniqueness for
/// safety instead.
pub const DEFAULT_DEDUP_WINDOW: usize = 100_000;

/// Tracks recently accepted requests to reject immediate duplicates,
/// and the transient session each in-flight request's reply should be
/// routed back to.
pub struct RequestLog {
    capacity: usize,
    seen: OrderedMap<(NodeId, Digest), i64>,
    sessions: HashMap<Digest, NodeId>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: collections::ordered_map(),
            sessions: collections::hash_map(),
        }
    }

    /// Whether `(client, digest)` was already accepted within the
    /// dedup memory window.
    pub fn is_duplicate(&self, client: NodeId, digest: Digest) -> bool {
        self.seen.contains_key(&(client, digest))
    }

    /// Whether `timestamp` (client clock, microseconds since epoch) is
    /// older than `now - horizon`.
    pub fn is_stale(&self, timestamp_micros: i64, now_micros: i64, horizon: Duration) -> bool {
        let horizon_micros = horizon.as_micros() as i64;
        now_micros.saturating_sub(timestamp_micros) > horizon_micros
    }

    /// Records `(client, digest)` as accepted, evicting the oldest
    /// entry if the window is full.
    pub fn record_accepted(&mut self, client: NodeId, digest: Digest, timestamp_micros: i64) {
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.insert((client, digest), timestamp_micros);
    }

    /// Remembers that `digest`'s reply should be routed back to
    /// `client`'s session, once executed.
    pub fn remember_session(&mut self, digest: Digest, client: NodeId) {
        self.sessions.insert(digest, client);
    }

    /// Takes (removing) the session a just-executed request's reply
    /// should be sent to, if this replica ever saw the originating
    /// request directly (as opposed to having only seen it embedded in
    /// a pre-prepare from another replica).
    pub fn take_session(&mut self, digest: &Digest) -> Option<NodeId> {
        self.sessions.remove(digest)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> Digest {
        Digest::from_bytes(&[byte; Digest::LENGTH]).unwrap()
    }

    #[test]
    fn duplicate_is_detected_within_window() {
        let mut log = RequestLog::new(4);
        let client = NodeId::from(7);
        assert!(!log.is_duplicate(client, digest(1)));
        log.record_accepted(client, digest(1), 1000);
        assert!(log.is_duplicate(client, digest(1)));
        assert!(!log.is_duplicate(client, digest(2)));
    }

    #[test]
    fn window_evicts_oldest_entry() {
        let mut log = RequestLog::new(2);
        let client = NodeId::from(1);
        log.record_accepted(client, digest(1), 1);
        log.record_accepted(client, digest(2), 2);
        log.record_accepted(client, digest(3), 3);
        assert!(!log.is_duplicate(client, digest(1)));
        assert!(log.is_duplicate(client, digest(2)));
        assert!(log.is_duplicate(client, digest(3)));
    }

    #[test]
    fn stale_timestamps_are_flagged() {
        let log = RequestLog::new(4);
        assert!(log.is_stale(0, 10_000_000, Duration::from_secs(5)));
        assert!(!log.is_stale(9_000_000, 10_000_000, Duration::from_secs(5)));
    }

    #[test]
    fn session_round_trips_until_taken() {
        let mut log = RequestLog::new(4);
        let client = NodeId::from(3);
        log.remember_session(digest(9), client);
        assert_eq!(log.take_session(&digest(9)), Some(client));
        assert_eq!(log.take_session(&digest(9)), None);
    }
}
