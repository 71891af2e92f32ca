//! The three-phase PBFT protocol: durable per-request evidence
//! ([`operation`]), the engine that drives pre-prepare/prepare/commit/
//! execute ([`engine`]), per-request liveness timers
//! ([`failure_detector`]), and reconfiguration proposals
//! ([`reconfig`]).

pub mod engine;
pub mod failure_detector;
pub mod operation;
pub mod reconfig;

pub use engine::{ClientOutcome, Engine};
pub use operation::{Operation, OperationManager, Stage};
