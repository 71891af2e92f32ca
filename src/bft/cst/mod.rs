//! Checkpoint accumulation and stability ([`checkpoint`]), and the
//! GET_STATE/SET_STATE catch-up exchange a behind replica uses to
//! install a stable checkpoint's state ([`state_transfer`]).
//!
//! Named `cst` after the teacher's own collaborative state transfer
//! module, which this replaces: the teacher's batch-consensus
//! `CollabStateTransfer` (quorum-of-identical-snapshot voting across a
//! `Log<State<S>, ...>`) doesn't fit spec.md §4.5's single-attestant,
//! self-verifying-hash design, so it's rebuilt here against the
//! `OperationManager`/`Engine` evidence model from
//! `bft::consensus::operation` instead.

pub mod checkpoint;
pub mod state_transfer;

pub use checkpoint::{CheckpointEffect, CheckpointManager};
pub use state_transfer::{StateTransfer, StateTransferEffect, StateTransferStatus};
