//! Serialization contract between the replication core and the
//! application built on top of it.

#[cfg(feature = "serialize_serde")]
use serde::{de::DeserializeOwned, Serialize};

use crate::bft::error::*;

/// Bundles together the application-defined state, request and reply
/// types, along with how to turn each of them into bytes.
///
/// A [`Service`](crate::bft::executable::Service) implementation picks
/// one `SharedData` to plug into the replication core; everything the
/// core needs to move a value across the wire or into storage goes
/// through this trait, so the core itself never needs to know anything
/// concrete about the application's types.
pub trait SharedData {
    type State: Send + Clone;
    type Request: Send;
    type Reply: Send;

    fn serialize_state(w: &mut Vec<u8>, state: &Self::State) -> Result<()>;
    fn deserialize_state(r: &[u8]) -> Result<Self::State>;

    fn serialize_request(w: &mut Vec<u8>, request: &Self::Request) -> Result<()>;
    fn deserialize_request(r: &[u8]) -> Result<Self::Request>;

    fn serialize_reply(w: &mut Vec<u8>, reply: &Self::Reply) -> Result<()>;
    fn deserialize_reply(r: &[u8]) -> Result<Self::Reply>;
}

/// A blanket `SharedData` for any application whose state, request and
/// reply types already implement `serde::Serialize`/`Deserialize`,
/// sparing most services from writing their own (de)serialization
/// boilerplate.
#[cfg(feature = "serialize_serde")]
pub struct Serde<S, Q, P>(std::marker::PhantomData<(S, Q, P)>);

#[cfg(feature = "serialize_serde")]
impl<S, Q, P> SharedData for Serde<S, Q, P>
where
    S: Serialize + DeserializeOwned + Send + Clone,
    Q: Serialize + DeserializeOwned + Send,
    P: Serialize + DeserializeOwned + Send,
{
    type State = S;
    type Request = Q;
    type Reply = P;

    fn serialize_state(w: &mut Vec<u8>, state: &Self::State) -> Result<()> {
        serde_json::to_writer(w, state).wrapped(ErrorKind::CommunicationMessage)
    }

    fn deserialize_state(r: &[u8]) -> Result<Self::State> {
        serde_json::from_slice(r).wrapped(ErrorKind::CommunicationMessage)
    }

    fn serialize_request(w: &mut Vec<u8>, request: &Self::Request) -> Result<()> {
        serde_json::to_writer(w, request).wrapped(ErrorKind::CommunicationMessage)
    }

    fn deserialize_request(r: &[u8]) -> Result<Self::Request> {
        serde_json::from_slice(r).wrapped(ErrorKind::CommunicationMessage)
    }

    fn serialize_reply(w: &mut Vec<u8>, reply: &Self::Reply) -> Result<()> {
        serde_json::to_writer(w, reply).wrapped(ErrorKind::CommunicationMessage)
    }

    fn deserialize_reply(r: &[u8]) -> Result<Self::Reply> {
        serde_json::from_slice(r).wrapped(ErrorKind::CommunicationMessage)
    }
}
