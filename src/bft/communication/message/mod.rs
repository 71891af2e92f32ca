//! Types of messages traded between replicas and clients: the wire
//! envelope ([`Header`]/[`WireMessage`]), and the catalogue of
//! application-level payloads a [`SystemMessage`] can carry.

use std::mem::MaybeUninit;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::socket::Socket;
use crate::bft::communication::NodeId;
use crate::bft::consensus::reconfig::ConfigChangeMsg;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::{KeyPair, PublicKey, Signature};
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;
use crate::bft::timeouts::TimeoutKind;

/// A header that precedes every message in transit on the wire.
///
/// A fixed `Header::LENGTH` bytes are read before the payload; the
/// header carries the signature over `(from, to, length, payload)`,
/// so a corrupted or forged payload is caught before it's ever
/// deserialized.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct Header {
    pub(crate) version: u32,
    pub(crate) from: u32,
    pub(crate) to: u32,
    pub(crate) length: u64,
    pub(crate) signature: [u8; Signature::LENGTH],
}

impl Header {
    pub const LENGTH: usize = std::mem::size_of::<Self>();

    pub fn from(&self) -> NodeId {
        NodeId::from(self.from)
    }

    pub fn to(&self) -> NodeId {
        NodeId::from(self.to)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    unsafe fn serialize_into_unchecked(self, buf: &mut [u8]) {
        let hdr: [u8; Self::LENGTH] = std::mem::transmute(self);
        buf[..Self::LENGTH].copy_from_slice(&hdr[..]);
    }

    pub fn serialize_into(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to serialize into")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { self.serialize_into_unchecked(buf) })
    }

    unsafe fn deserialize_from_unchecked(buf: &[u8]) -> Self {
        let mut hdr: [u8; Self::LENGTH] = MaybeUninit::uninit().assume_init();
        hdr.copy_from_slice(&buf[..Self::LENGTH]);
        std::mem::transmute(hdr)
    }

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to deserialize from")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { Self::deserialize_from_unchecked(buf) })
    }

    fn signed_payload(from: NodeId, to: NodeId, length: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 4 + 8 + payload.len());
        buf.extend_from_slice(&u32::from(from).to_le_bytes());
        buf.extend_from_slice(&u32::from(to).to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

/// A message ready to be sent over the wire.
pub struct WireMessage<'a> {
    pub(crate) header: Header,
    pub(crate) payload: &'a [u8],
}

impl<'a> WireMessage<'a> {
    pub const CURRENT_VERSION: u32 = 1;

    /// Builds and signs a new wire message.
    pub fn new(from: NodeId, to: NodeId, payload: &'a [u8], sk: &KeyPair) -> Self {
        let length = payload.len() as u64;
        let to_sign = Header::signed_payload(from, to, length, payload);
        let sig = sk.sign(&to_sign);
        let mut signature = [0; Signature::LENGTH];
        signature.copy_from_slice(sig.as_bytes());
        let header = Header {
            version: Self::CURRENT_VERSION,
            from: from.into(),
            to: to.into(),
            length,
            signature,
        };
        Self { header, payload }
    }

    pub fn into_inner(self) -> (Header, &'a [u8]) {
        (self.header, self.payload)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Verifies the header's version, declared length and signature
    /// against the sender's known public key.
    pub fn is_valid(&self, sender_key: &PublicKey) -> bool {
        if self.header.version != Self::CURRENT_VERSION {
            return false;
        }
        if self.header.length as usize != self.payload.len() {
            return false;
        }
        let to_sign = Header::signed_payload(
            self.header.from(),
            self.header.to(),
            self.header.length,
            self.payload,
        );
        let sig = match Signature::from_bytes(&self.header.signature[..]) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        sender_key.verify(&to_sign, &sig).is_ok()
    }
}

/// Events funneled to the single-threaded replica actor.
pub enum Message<O> {
    System(Header, SystemMessage<O>),
    ConnectedTx(NodeId, Socket),
    ConnectedRx(NodeId, Socket),
    Error(NodeId, Error),
    Timeout(TimeoutKind),
}

/// Every kind of protocol message a replica or client may send.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage<O> {
    /// A client's request, carrying either a database operation or a
    /// reconfiguration proposal.
    Request(RequestMessage<O>),
    /// A reply to a previously submitted client request.
    Reply(ReplyMessage),
    /// A three-phase consensus protocol message.
    Consensus(ConsensusMessage),
    /// A view-change sub-protocol message.
    ViewChange(ViewChangeMessage),
    /// A checkpoint / state-transfer sub-protocol message.
    Cst(CstMessage),
    /// A read-only request for this replica's current status.
    StatusRequest(StatusRequestMessage),
    /// This replica's reply to a [`StatusRequestMessage`].
    StatusResponse(StatusResponseMessage),
    /// A safety alarm raised by the audit layer.
    Audit(AuditMessage),
}

/// Asks a replica to report its current status; carries no content of
/// its own.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct StatusRequestMessage;

/// A read-only snapshot of a replica's engine/checkpoint state, per
/// spec.md's "Status / audit" component ("Read-only aggregation of
/// each component's state").
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct StatusResponseMessage {
    pub view: SeqNo,
    pub next_sequence: SeqNo,
    pub next_execute: SeqNo,
    pub latest_local_checkpoint: Option<(SeqNo, Digest)>,
    pub latest_stable_checkpoint: Option<(SeqNo, Digest)>,
}

/// A disagreement the audit layer observed, broadcast so the rest of
/// the swarm (and any status-polling operator) also learns of it.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum AuditMessage {
    PrimaryConflict {
        view: SeqNo,
        first: NodeId,
        second: NodeId,
    },
    CommitConflict {
        sequence: SeqNo,
        first: Digest,
        second: Digest,
    },
}

/// The payload of a client request: either a database operation, or a
/// proposal to change the system's membership.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum RequestPayload<O> {
    Database(O),
    Reconfiguration(ConfigChangeMsg),
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct RequestMessage<O> {
    session: u64,
    operation_id: u64,
    payload: RequestPayload<O>,
}

impl<O> RequestMessage<O> {
    pub fn new(session: u64, operation_id: u64, payload: RequestPayload<O>) -> Self {
        Self {
            session,
            operation_id,
            payload,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    pub fn payload(&self) -> &RequestPayload<O> {
        &self.payload
    }

    pub fn into_payload(self) -> RequestPayload<O> {
        self.payload
    }

    /// Whether this is a plain database request.
    pub fn has_db_request(&self) -> bool {
        matches!(self.payload, RequestPayload::Database(_))
    }

    /// Whether this is a reconfiguration proposal.
    pub fn has_config_request(&self) -> bool {
        matches!(self.payload, RequestPayload::Reconfiguration(_))
    }
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ReplyMessage {
    session: u64,
    operation_id: u64,
    payload: Vec<u8>,
}

impl ReplyMessage {
    pub fn new(session: u64, operation_id: u64, payload: Vec<u8>) -> Self {
        Self {
            session,
            operation_id,
            payload,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A message from the three-phase consensus sub-protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ConsensusMessage {
    seq: SeqNo,
    view: SeqNo,
    kind: ConsensusMessageKind,
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ConsensusMessageKind {
    /// A primary proposing a request for the given sequence number: the
    /// digest it computed, and the serialized request envelope the
    /// digest was computed over, so a backup can save it and verify the
    /// hash without a separate round-trip.
    PrePrepare(Digest, Vec<u8>),
    /// A backup voting to prepare the given request.
    Prepare(Digest),
    /// A replica voting to commit the given request.
    Commit(Digest),
}

impl ConsensusMessage {
    pub fn new(seq: SeqNo, view: SeqNo, kind: ConsensusMessageKind) -> Self {
        Self { seq, view, kind }
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    pub fn view(&self) -> SeqNo {
        self.view
    }

    pub fn kind(&self) -> &ConsensusMessageKind {
        &self.kind
    }

    /// Consumes the envelope, returning its `(sequence, view, kind)`.
    pub fn into_parts(self) -> (SeqNo, SeqNo, ConsensusMessageKind) {
        (self.seq, self.view, self.kind)
    }

    pub fn digest(&self) -> &Digest {
        match &self.kind {
            ConsensusMessageKind::PrePrepare(d, _) => d,
            ConsensusMessageKind::Prepare(d) => d,
            ConsensusMessageKind::Commit(d) => d,
        }
    }
}

/// A single stable-checkpoint attestation, carried inside a
/// view-change message's checkpoint proof bundle.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CheckpointProof {
    pub sender: NodeId,
    pub sequence: SeqNo,
    pub digest: Digest,
}

/// Evidence that a single sequence number was `prepared` at the
/// sending replica: the pre-prepare it accepted, plus the distinct
/// prepare votes it collected for it.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PreparedProof {
    pub sequence: SeqNo,
    pub view: SeqNo,
    pub digest: Digest,
    pub preparers: Vec<NodeId>,
}

/// A message from the view-change sub-protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ViewChangeMessage {
    /// A lightweight signal that the sender suspects the primary of
    /// `view` and intends to move to `view + 1`; broadcast immediately
    /// on failure-detector expiry, ahead of the (possibly expensive to
    /// assemble) full proof bundle.
    StartViewChange { view: SeqNo },
    /// A replica's full evidence in support of a view-change to `view`:
    /// the checkpoint proof for its base sequence, and a prepared
    /// proof for every sequence above that base it has prepared.
    ViewChangeProof {
        view: SeqNo,
        base_sequence: SeqNo,
        checkpoint_proof: Vec<CheckpointProof>,
        prepared: Vec<PreparedProof>,
    },
    /// Sent by the new primary, carrying the set of `ViewChangeProof`s
    /// it assembled a quorum out of, and the deterministically derived
    /// pre-prepares that should be installed for `view`.
    NewView {
        view: SeqNo,
        proofs: Vec<(NodeId, ViewChangeMessage)>,
        pre_prepares: Vec<(SeqNo, Digest)>,
    },
}

/// A message from the checkpoint / state-transfer sub-protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum CstMessage {
    /// Announces this replica has locally checkpointed up to `seq`,
    /// with application state digest `digest`.
    CheckpointDone { seq: SeqNo, digest: Digest },
    /// Requests the full application state as of the sender's last
    /// stable checkpoint.
    GetState { seq: SeqNo },
    /// Carries the application state snapshot as of `seq`.
    SetState {
        seq: SeqNo,
        digest: Digest,
        state: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::signature::KeyPair;

    #[test]
    fn header_serialize_roundtrip() {
        let sk = KeyPair::generate().unwrap();
        let (old_header, _) = WireMessage::new(
            NodeId::from(0),
            NodeId::from(3),
            b"I am a cool payload!",
            &sk,
        )
        .into_inner();
        let mut buf = [0; Header::LENGTH];
        old_header.serialize_into(&mut buf[..]).expect("Serialize failed");
        let new_header = Header::deserialize_from(&buf[..]).expect("Deserialize failed");
        assert_eq!(old_header.from, new_header.from);
        assert_eq!(old_header.to, new_header.to);
        assert_eq!(old_header.signature, new_header.signature);
    }

    #[test]
    fn wire_message_signature_is_checked() {
        let sk = KeyPair::generate().unwrap();
        let pk = sk.public_key();
        let wm = WireMessage::new(NodeId::from(0), NodeId::from(1), b"payload", &sk);
        assert!(wm.is_valid(&pk));

        let tampered = WireMessage {
            header: wm.header,
            payload: b"tampered",
        };
        assert!(!tampered.is_valid(&pk));
    }
}
