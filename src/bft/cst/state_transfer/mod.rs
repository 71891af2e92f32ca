//! The GET_STATE/SET_STATE catch-up exchange (spec.md §4.5
//! "State-transfer protocol"), grounded on
//! `original_source/pbft/pbft_checkpoint_manager.cpp::send_state_request`
//! and the `pbft_membership_msg` wire kind (spec.md §6).
//!
//! Unlike the teacher's `CollabStateTransfer` (which gathers a quorum of
//! matching snapshots before trusting one), this exchange is against a
//! single attestant at a time: the attestant was already one of the
//! honest-majority senders that made the checkpoint stable, and the
//! reply is self-verifying against the declared state hash, so no
//! further voting is needed — a divergent reply just means retrying
//! against a different attestant (handled by the caller via
//! [`CheckpointManager::pick_retry_attestant`](super::checkpoint::CheckpointManager::pick_retry_attestant)).

use crate::bft::communication::message::CstMessage;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::{self, Digest};
use crate::bft::ordering::SeqNo;

/// What this replica is currently doing about catching up to a stable
/// checkpoint it's behind on.
#[derive(Debug, Clone, Copy)]
pub enum StateTransferStatus {
    Idle,
    AwaitingState {
        attestant: NodeId,
        sequence: SeqNo,
        digest: Digest,
    },
}

/// Something the caller must do as a result of driving the state
/// transfer exchange.
pub enum StateTransferEffect {
    Send(NodeId, CstMessage),
    /// The received snapshot validated; hand it to the service adapter
    /// and storage, and record `latest_local = (sequence, digest)`.
    InstallSnapshot {
        sequence: SeqNo,
        digest: Digest,
        state: Vec<u8>,
    },
    /// The received snapshot's hash doesn't match what was declared:
    /// a SAFETY violation, logged by the audit layer.
    Diverged {
        attestant: NodeId,
        sequence: SeqNo,
        expected: Digest,
        got: Digest,
    },
}

/// Drives a single outstanding GET_STATE/SET_STATE exchange.
pub struct StateTransfer {
    status: StateTransferStatus,
}

impl Default for StateTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTransfer {
    pub fn new() -> Self {
        Self {
            status: StateTransferStatus::Idle,
        }
    }

    pub fn status(&self) -> StateTransferStatus {
        self.status
    }

    /// Requests state as of `(sequence, digest)` from `attestant`.
    pub fn begin(&mut self, attestant: NodeId, sequence: SeqNo, digest: Digest) -> StateTransferEffect {
        self.status = StateTransferStatus::AwaitingState {
            attestant,
            sequence,
            digest,
        };
        StateTransferEffect::Send(attestant, CstMessage::GetState { seq: sequence })
    }

    /// Recipient side: builds the `SET_STATE` reply to an incoming
    /// `GET_STATE`, hashing `state` itself so the requester can verify
    /// it without a round-trip.
    pub fn build_reply(seq: SeqNo, state: Vec<u8>) -> CstMessage {
        let digest = hash::digest(&state);
        CstMessage::SetState { seq, digest, state }
    }

    /// Processes an incoming `SET_STATE`. Returns `None` if it doesn't
    /// match what's currently outstanding (a stale or unsolicited
    /// reply), in which case it's simply dropped.
    pub fn handle_set_state(
        &mut self,
        sender: NodeId,
        seq: SeqNo,
        declared_digest: Digest,
        state: Vec<u8>,
    ) -> Option<StateTransferEffect> {
        let (attestant, expected_seq, expected_digest) = match self.status {
            StateTransferStatus::AwaitingState {
                attestant,
                sequence,
                digest,
            } => (attestant, sequence, digest),
            StateTransferStatus::Idle => return None,
        };
        if sender != attestant || seq != expected_seq {
            return None;
        }

        self.status = StateTransferStatus::Idle;
        let actual_digest = hash::digest(&state);
        if actual_digest != declared_digest || declared_digest != expected_digest {
            return Some(StateTransferEffect::Diverged {
                attestant,
                sequence: seq,
                expected: expected_digest,
                got: actual_digest,
            });
        }
        Some(StateTransferEffect::InstallSnapshot {
            sequence: seq,
            digest: actual_digest,
            state,
        })
    }

    /// A CST timeout fired while still awaiting a reply: retries
    /// against a different attestant.
    pub fn retry(&mut self, attestant: NodeId, sequence: SeqNo, digest: Digest) -> StateTransferEffect {
        self.begin(attestant, sequence, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(b: u8) -> Digest {
        Digest::from_bytes(&[b; Digest::LENGTH]).unwrap()
    }

    #[test]
    fn reply_hash_matches_what_handle_set_state_recomputes() {
        let state = b"snapshot bytes".to_vec();
        let reply = StateTransfer::build_reply(SeqNo::from(100), state.clone());
        match reply {
            CstMessage::SetState { digest, state: s, .. } => {
                assert_eq!(digest, hash::digest(&s));
            }
            _ => panic!("expected SetState"),
        }
    }

    #[test]
    fn matching_reply_installs_snapshot() {
        let mut st = StateTransfer::new();
        let state = b"snapshot bytes".to_vec();
        let expected = hash::digest(&state);
        st.begin(NodeId::from(1), SeqNo::from(100), expected);

        let effect = st
            .handle_set_state(NodeId::from(1), SeqNo::from(100), expected, state.clone())
            .unwrap();
        assert!(matches!(effect, StateTransferEffect::InstallSnapshot { sequence, .. } if sequence == SeqNo::from(100)));
        assert!(matches!(st.status(), StateTransferStatus::Idle));
    }

    #[test]
    fn mismatched_hash_is_flagged_as_divergence() {
        let mut st = StateTransfer::new();
        st.begin(NodeId::from(1), SeqNo::from(100), digest(7));

        let effect = st
            .handle_set_state(NodeId::from(1), SeqNo::from(100), digest(7), b"wrong bytes".to_vec())
            .unwrap();
        assert!(matches!(effect, StateTransferEffect::Diverged { .. }));
    }

    #[test]
    fn unsolicited_reply_is_dropped() {
        let mut st = StateTransfer::new();
        assert!(st
            .handle_set_state(NodeId::from(1), SeqNo::from(100), digest(7), b"x".to_vec())
            .is_none());
    }

    #[test]
    fn reply_from_wrong_sender_is_dropped() {
        let mut st = StateTransfer::new();
        st.begin(NodeId::from(1), SeqNo::from(100), digest(7));
        assert!(st
            .handle_set_state(NodeId::from(2), SeqNo::from(100), digest(7), b"x".to_vec())
            .is_none());
    }
}
