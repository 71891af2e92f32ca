//! `swarm-pbft` — the consensus core of a Byzantine-fault-tolerant
//! replicated key-value database node.
//!
//! This crate implements the PBFT three-phase protocol, the durable
//! operation log, checkpointing and state transfer, and the view-change /
//! reconfiguration protocols described in the project's design
//! documents. The concrete KV storage backend, wire transport framing,
//! peer discovery source, and cryptographic primitives are reached
//! through traits so that they can be swapped independently of the
//! consensus core.

pub mod bft;

pub use bft::{init, InitConfig};
