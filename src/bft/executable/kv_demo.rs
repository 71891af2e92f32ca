//! A reference in-memory key-value [`Service`](super::Service), used
//! by the crate's integration tests and `demos/` binaries.
//!
//! Grounded on `database_pbft_service.cpp`'s CRUD switch over a
//! `crud_base` collaborator: this fixture inlines that collaborator as
//! a plain `BTreeMap`, since the concrete storage backend behind the
//! replicated service is out of scope (spec.md §1). It is a test
//! double, not the production database this crate's core is meant to
//! sit underneath.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bft::communication::serialize::Serde;
use crate::bft::error::*;
use crate::bft::executable::Service;

/// A single CRUD command against the demo key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    Create { key: Vec<u8>, value: Vec<u8> },
    Read { key: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// The outcome of applying a [`KvCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvReply {
    Ok,
    Value(Option<Vec<u8>>),
    Err(KvError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum KvError {
    /// `Create` against a key that already holds a value.
    AlreadyExists,
    /// `Update`/`Delete` against a key with no value.
    NotFound,
}

/// The demo service's `SharedData`: a `BTreeMap<Vec<u8>, Vec<u8>>`
/// state, [`KvCommand`] requests, [`KvReply`] replies, all carried
/// over the crate's default `serde_json` wire encoding.
pub type KvData = Serde<BTreeMap<Vec<u8>, Vec<u8>>, KvCommand, KvReply>;

/// An in-memory key-value store, replicated by the PBFT core.
#[derive(Default)]
pub struct KvService;

impl Service for KvService {
    type Data = KvData;

    fn initial_state(&mut self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(BTreeMap::new())
    }

    fn update(&mut self, state: &mut BTreeMap<Vec<u8>, Vec<u8>>, request: KvCommand) -> KvReply {
        match request {
            KvCommand::Create { key, value } => {
                if state.contains_key(&key) {
                    KvReply::Err(KvError::AlreadyExists)
                } else {
                    state.insert(key, value);
                    KvReply::Ok
                }
            }
            KvCommand::Read { key } => KvReply::Value(state.get(&key).cloned()),
            KvCommand::Update { key, value } => {
                if state.contains_key(&key) {
                    state.insert(key, value);
                    KvReply::Ok
                } else {
                    KvReply::Err(KvError::NotFound)
                }
            }
            KvCommand::Delete { key } => {
                if state.remove(&key).is_some() {
                    KvReply::Ok
                } else {
                    KvReply::Err(KvError::NotFound)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_read_round_trips_the_value() {
        let mut svc = KvService;
        let mut state = svc.initial_state().unwrap();
        let reply = svc.update(
            &mut state,
            KvCommand::Create { key: b"k1".to_vec(), value: b"v1".to_vec() },
        );
        assert!(matches!(reply, KvReply::Ok));
        let reply = svc.update(&mut state, KvCommand::Read { key: b"k1".to_vec() });
        assert!(matches!(reply, KvReply::Value(Some(v)) if v == b"v1"));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let mut svc = KvService;
        let mut state = svc.initial_state().unwrap();
        svc.update(&mut state, KvCommand::Create { key: b"k1".to_vec(), value: b"v1".to_vec() });
        let reply = svc.update(
            &mut state,
            KvCommand::Create { key: b"k1".to_vec(), value: b"v2".to_vec() },
        );
        assert!(matches!(reply, KvReply::Err(KvError::AlreadyExists)));
    }

    #[test]
    fn update_or_delete_missing_key_is_not_found() {
        let mut svc = KvService;
        let mut state = svc.initial_state().unwrap();
        let reply = svc.update(&mut state, KvCommand::Update { key: b"missing".to_vec(), value: b"v".to_vec() });
        assert!(matches!(reply, KvReply::Err(KvError::NotFound)));
        let reply = svc.update(&mut state, KvCommand::Delete { key: b"missing".to_vec() });
        assert!(matches!(reply, KvReply::Err(KvError::NotFound)));
    }

    #[test]
    fn state_hash_is_deterministic_across_equal_states() {
        let mut svc = KvService;
        let mut a = svc.initial_state().unwrap();
        let mut b = svc.initial_state().unwrap();
        svc.update(&mut a, KvCommand::Create { key: b"k".to_vec(), value: b"v".to_vec() });
        svc.update(&mut b, KvCommand::Create { key: b"k".to_vec(), value: b"v".to_vec() });
        assert_eq!(svc.service_state_hash(&a).unwrap(), svc.service_state_hash(&b).unwrap());
    }
}
