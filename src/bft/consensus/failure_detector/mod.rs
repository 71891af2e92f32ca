//! Per-request liveness timers that surface into a view-change when
//! the primary stalls.
//!
//! Only a single deadline timer is ever armed at once, covering the
//! oldest outstanding request; later requests queue behind it. This
//! mirrors the original system's failure detector, which tracked one
//! outstanding deadline rather than a timer per request, so a batch of
//! client requests arriving together doesn't arm (and have to cancel)
//! a storm of timers.
//!
//! The armed deadline is persisted before the corresponding timer is
//! scheduled (spec §9 "timer cancellation races"), so that a crash
//! inside the race window between persisting and scheduling is
//! resolved, on restart, by simply re-arming from whatever deadline was
//! last durably recorded.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bft::collections::{self, BoundedFifo, HashSet};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::storage::typed::Persistent;
use crate::bft::storage::Storage;

/// Default size of the completed-request memory (spec §3, §9 Open
/// Question (a)).
pub const DEFAULT_COMPLETED_MEMORY: usize = 10_000;

/// The deadline currently armed, if any: the request hash the timer
/// is watching, and the duration that was used to arm it (so the same
/// grace period can be reapplied after a crash-restart).
#[derive(Clone, Serialize, Deserialize)]
struct ArmedDeadline {
    digest: Digest,
    millis: u64,
}

/// Tracks outstanding (seen but not yet executed) request hashes, and
/// the single deadline timer covering the oldest of them.
pub struct FailureDetector<'s> {
    armed: Persistent<'s, ArmedDeadline>,
    outstanding: VecDeque<Digest>,
    outstanding_set: HashSet<Digest>,
    completed: BoundedFifo<Digest>,
    default_timeout: Duration,
}

/// What the caller should do after feeding the detector a new event.
pub enum Arm {
    /// No timer needs to be (re)scheduled.
    Unchanged,
    /// Schedule a deadline timer for `digest`, `after` from now.
    Schedule { digest: Digest, after: Duration },
    /// Cancel whatever timer was scheduled; nothing is outstanding.
    Disarm,
}

impl<'s> FailureDetector<'s> {
    pub fn new(storage: &'s dyn Storage, default_timeout: Duration) -> Self {
        Self {
            armed: Persistent::open(storage, b"failure/deadline".to_vec()),
            outstanding: VecDeque::new(),
            outstanding_set: collections::hash_set(),
            completed: BoundedFifo::new(DEFAULT_COMPLETED_MEMORY),
            default_timeout,
        }
    }

    /// Re-arms from whatever deadline was last persisted, e.g. right
    /// after a crash-restart. The caller is expected to schedule a
    /// timer for the returned digest if `Some`.
    pub fn recover(&self) -> Result<Option<Digest>> {
        Ok(self.armed.get()?.map(|a| a.digest))
    }

    /// Records that `digest` has been seen (pre-prepared or locally
    /// proposed) and is now outstanding. Returns what to do with the
    /// deadline timer.
    pub fn request_seen(&mut self, digest: Digest) -> Result<Arm> {
        if self.outstanding_set.contains(&digest) || self.completed.iter().any(|d| *d == digest) {
            return Ok(Arm::Unchanged);
        }
        let was_empty = self.outstanding.is_empty();
        self.outstanding.push_back(digest);
        self.outstanding_set.insert(digest);
        if was_empty {
            self.arm(digest)?;
            Ok(Arm::Schedule {
                digest,
                after: self.default_timeout,
            })
        } else {
            Ok(Arm::Unchanged)
        }
    }

    /// Records that `digest` has executed. If it was the request the
    /// timer covered, re-arms for whatever is next in line (if
    /// anything), or disarms entirely.
    pub fn request_executed(&mut self, digest: &Digest) -> Result<Arm> {
        self.outstanding_set.remove(digest);
        self.outstanding.retain(|d| d != digest);
        self.completed.push(*digest);

        let currently_armed = self.armed.get()?.map(|a| a.digest);
        if currently_armed.as_ref() != Some(digest) {
            return Ok(Arm::Unchanged);
        }
        match self.outstanding.front().copied() {
            Some(next) => {
                self.arm(next)?;
                Ok(Arm::Schedule {
                    digest: next,
                    after: self.default_timeout,
                })
            }
            None => {
                self.armed.remove()?;
                Ok(Arm::Disarm)
            }
        }
    }

    /// Whether `digest` is the one the currently armed timer is
    /// watching; used to ignore a timeout event for a request that has
    /// since completed.
    pub fn is_current_deadline(&self, digest: &Digest) -> Result<bool> {
        Ok(self.armed.get()?.map(|a| a.digest).as_ref() == Some(digest))
    }

    fn arm(&self, digest: Digest) -> Result<()> {
        self.armed.set(&ArmedDeadline {
            digest,
            millis: self.default_timeout.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::storage::mem::MemStorage;

    fn digest(b: u8) -> Digest {
        Digest::from_bytes(&[b; Digest::LENGTH]).unwrap()
    }

    #[test]
    fn first_request_arms_the_timer() {
        let storage = MemStorage::new();
        let mut fd = FailureDetector::new(&storage, Duration::from_secs(1));
        match fd.request_seen(digest(1)).unwrap() {
            Arm::Schedule { digest: d, .. } => assert_eq!(d, digest(1)),
            _ => panic!("expected schedule"),
        }
    }

    #[test]
    fn second_request_does_not_rearm() {
        let storage = MemStorage::new();
        let mut fd = FailureDetector::new(&storage, Duration::from_secs(1));
        fd.request_seen(digest(1)).unwrap();
        assert!(matches!(fd.request_seen(digest(2)).unwrap(), Arm::Unchanged));
    }

    #[test]
    fn executing_oldest_rearms_for_next() {
        let storage = MemStorage::new();
        let mut fd = FailureDetector::new(&storage, Duration::from_secs(1));
        fd.request_seen(digest(1)).unwrap();
        fd.request_seen(digest(2)).unwrap();
        match fd.request_executed(&digest(1)).unwrap() {
            Arm::Schedule { digest: d, .. } => assert_eq!(d, digest(2)),
            _ => panic!("expected rearm"),
        }
    }

    #[test]
    fn executing_last_disarms() {
        let storage = MemStorage::new();
        let mut fd = FailureDetector::new(&storage, Duration::from_secs(1));
        fd.request_seen(digest(1)).unwrap();
        assert!(matches!(fd.request_executed(&digest(1)).unwrap(), Arm::Disarm));
    }

    #[test]
    fn recovers_armed_deadline_after_restart() {
        let storage = MemStorage::new();
        {
            let mut fd = FailureDetector::new(&storage, Duration::from_secs(1));
            fd.request_seen(digest(5)).unwrap();
        }
        let fd = FailureDetector::new(&storage, Duration::from_secs(1));
        assert_eq!(fd.recover().unwrap(), Some(digest(5)));
    }
}
