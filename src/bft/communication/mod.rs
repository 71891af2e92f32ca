//! Communication primitives: wire message formats, and the `Node`
//! abstraction used to exchange them with peers.

#[cfg(not(feature = "expose_impl"))]
mod socket;

#[cfg(feature = "expose_impl")]
pub mod socket;

pub mod channel;
pub mod message;
pub mod serialize;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_timer::Delay;

use crate::bft::async_runtime as rt;
use crate::bft::collections::HashMap;
use crate::bft::communication::channel::{new_message_channel, MessageChannelRx, MessageChannelTx};
use crate::bft::communication::message::{Header, Message, SystemMessage, WireMessage};
use crate::bft::communication::socket::{Listener, Socket};
use crate::bft::crypto::signature::{KeyPair, PublicKey};
use crate::bft::error::*;

/// A `NodeId` represents the id of a process in the BFT system.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// Represents a configuration used to bootstrap a [`Node`].
pub struct NodeConfig {
    /// The number of replicas allowed to be faulty. BFT requires
    /// `n >= 3*f + 1` total replicas.
    pub f: usize,
    /// The id of this node.
    pub id: NodeId,
    /// The network address of every node in the system.
    pub addrs: HashMap<NodeId, SocketAddr>,
    /// The public keys of every node in the system.
    pub pk: HashMap<NodeId, PublicKey>,
    /// This node's own secret key.
    pub sk: KeyPair,
}

/// A `Node` owns every peer connection this replica keeps, and is the
/// core component used to exchange signed messages with them.
pub struct Node<O> {
    id: NodeId,
    my_key: Arc<KeyPair>,
    peer_keys: Arc<HashMap<NodeId, PublicKey>>,
    peer_addrs: HashMap<NodeId, SocketAddr>,
    my_tx: MessageChannelTx<O>,
    my_rx: MessageChannelRx<O>,
    peer_tx: HashMap<NodeId, Socket>,
}

impl<O> Node<O>
where
    O: Send + 'static,
    SystemMessage<O>: serde::de::DeserializeOwned,
{
    const CHAN_BOUND: usize = 1024;
    const CONNECT_RETRIES: usize = 10;

    /// Bootstraps a `Node`, connecting it to every peer in `cfg.addrs`.
    pub async fn bootstrap(cfg: NodeConfig) -> Result<Self> {
        let id = cfg.id;

        if cfg.addrs.len() < 3 * cfg.f + 1 {
            return Err("not enough replicas for the given fault tolerance")
                .wrapped(ErrorKind::Communication);
        }
        let my_addr = *cfg
            .addrs
            .get(&id)
            .ok_or_else(|| Error::simple(ErrorKind::Communication))?;

        let listener = socket::bind(my_addr).await?;
        let (tx, rx) = new_message_channel::<O>(Self::CHAN_BOUND);

        rt::spawn(Self::rx_side_accept(listener, tx.clone()));

        let my_key = Arc::new(cfg.sk);
        let peer_keys = Arc::new(cfg.pk);

        Ok(Node {
            id,
            my_key,
            peer_keys,
            peer_addrs: cfg.addrs,
            my_tx: tx,
            my_rx: rx,
            peer_tx: crate::bft::collections::hash_map(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// A handle that feeds [`Message::Timeout`] events into this
    /// node's own event queue, the same one [`Self::receive`] drains —
    /// so a `TimeoutsHandle` built from it and a [`Node`] can be handed
    /// to the same [`Replica`](crate::bft::core::Replica) and agree on
    /// a single stream of events.
    pub fn timeouts_handle(&self) -> crate::bft::timeouts::TimeoutsHandle<O> {
        crate::bft::timeouts::TimeoutsHandle::new(self.my_tx.clone())
    }

    async fn rx_side_accept(listener: Listener, tx: MessageChannelTx<O>) {
        loop {
            if let Ok(sock) = listener.accept().await {
                rt::spawn(Self::rx_side_accept_task(sock, tx.clone()));
            }
        }
    }

    async fn rx_side_accept_task(mut sock: Socket, mut tx: MessageChannelTx<O>) {
        let mut buf_header = [0; Header::LENGTH];
        if sock.read_exact(&mut buf_header[..]).await.is_err() {
            return;
        }
        let header = match Header::deserialize_from(&buf_header[..]) {
            Ok(h) => h,
            Err(_) => return,
        };
        let mut payload = vec![0; header.length as usize];
        if !payload.is_empty() && sock.read_exact(&mut payload[..]).await.is_err() {
            return;
        }
        match serde_json::from_slice::<SystemMessage<O>>(&payload[..]) {
            Ok(message) => {
                tx.send(Message::System(header, message)).await.unwrap_or(());
            }
            Err(_) => {
                // malformed payload: drop silently rather than feed it
                // into protocol state (spec: "Deserialization / signature").
            }
        }
    }

    /// Sends `message`, signed by this node's key, to `target`.
    pub async fn send(&mut self, message: &SystemMessage<O>, target: NodeId) -> Result<()>
    where
        SystemMessage<O>: serde::Serialize,
    {
        let payload = serde_json::to_vec(message).wrapped(ErrorKind::CommunicationMessage)?;
        self.send_payload(&payload[..], target).await
    }

    async fn send_payload(&mut self, payload: &[u8], target: NodeId) -> Result<()> {
        let wm = WireMessage::new(self.id, target, payload, &self.my_key);
        let (header, payload) = wm.into_inner();

        let sock = match self.peer_tx.get_mut(&target) {
            Some(sock) => sock,
            None => {
                let sock = self.connect_to(target).await?;
                self.peer_tx.insert(target, sock);
                self.peer_tx.get_mut(&target).unwrap()
            }
        };

        let mut buf = vec![0; Header::LENGTH];
        header.serialize_into(&mut buf[..])?;
        buf.extend_from_slice(payload);
        sock.write_all(&buf[..]).await
    }

    /// Sends `message` to every id in `targets`, reusing the same
    /// serialized payload for each recipient.
    pub async fn broadcast(&mut self, message: &SystemMessage<O>, targets: impl Iterator<Item = NodeId>)
    where
        SystemMessage<O>: serde::Serialize,
    {
        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(_) => return,
        };
        for target in targets {
            let _ = self.send_payload(&payload[..], target).await;
        }
    }

    async fn connect_to(&self, target: NodeId) -> Result<Socket> {
        let addr = *self
            .peer_addrs
            .get(&target)
            .ok_or_else(|| Error::simple(ErrorKind::Communication))?;
        for _ in 0..Self::CONNECT_RETRIES {
            if let Ok(sock) = socket::connect(addr).await {
                return Ok(sock);
            }
            Delay::new(Duration::from_millis(500)).await;
        }
        Err("failed to connect to peer").wrapped(ErrorKind::CommunicationSocket)
    }

    /// Receives the next event addressed to this node.
    pub async fn receive(&mut self) -> Result<Message<O>> {
        self.my_rx.recv().await
    }

    /// Verifies a wire message's signature against the sender's known
    /// public key.
    pub fn verify(&self, header: &Header, payload: &[u8]) -> bool {
        match self.peer_keys.get(&header.from()) {
            Some(key) => {
                let wm = WireMessage {
                    header: *header,
                    payload,
                };
                wm.is_valid(key)
            }
            None => false,
        }
    }
}
