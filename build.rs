//! Generates the `ErrorKind` enum consumed by `bft::error`.
//!
//! Keeping the list of kinds in one place here, rather than hand-writing
//! the enum in `src/`, mirrors how the teacher crate this workspace is
//! descended from generates its own `ErrorKind`: the list is the single
//! source of truth for every fallible subsystem in the crate.

use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

const KINDS: &[&str] = &[
    "Error",
    "Communication",
    "CommunicationMessage",
    "CommunicationSocket",
    "CryptoHash",
    "CryptoSignature",
    "Storage",
    "StorageNotSaved",
    "StorageValueTooLarge",
    "Log",
    "Consensus",
    "Checkpoint",
    "CheckpointDivergence",
    "Configuration",
    "Synchronizer",
    "Executable",
    "Audit",
    "Timeouts",
    "Dedup",
    "Stale",
    "ViewMismatch",
    "SequenceOutOfWindow",
    "DeadLetter",
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set by cargo");
    let dest = Path::new(&out_dir).join("error_kind.rs");

    let variants = KINDS.iter().map(|k| format!("    {},", k)).join("\n");

    let contents = format!(
        "/// The kind of an [`Error`](super::Error), identifying which \
         subsystem raised it.\n\
         #[derive(Debug, Copy, Clone, Eq, PartialEq)]\n\
         pub enum ErrorKind {{\n{variants}\n}}\n",
        variants = variants,
    );

    fs::write(&dest, contents).expect("failed to write generated ErrorKind");

    println!("cargo:rerun-if-changed=build.rs");
}
