//! The channel used to funnel every event (inbound messages, socket
//! connection notifications, errors) back to the single-threaded
//! replica actor. All I/O tasks are fire-and-forget; this channel is
//! how their results get serialized back onto the actor's own thread
//! of control, satisfying the single-writer rule the consensus engine
//! depends on.

use tokio::sync::mpsc;

use crate::bft::communication::message::Message;
use crate::bft::error::*;

pub struct MessageChannelTx<O> {
    inner: mpsc::Sender<Message<O>>,
}

pub struct MessageChannelRx<O> {
    inner: mpsc::Receiver<Message<O>>,
}

impl<O> Clone for MessageChannelTx<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O> MessageChannelTx<O> {
    pub async fn send(&mut self, message: Message<O>) -> Result<()> {
        self.inner
            .send(message)
            .await
            .simple(ErrorKind::Communication)
    }
}

impl<O> MessageChannelRx<O> {
    pub async fn recv(&mut self) -> Result<Message<O>> {
        self.inner
            .recv()
            .await
            .ok_or_else(|| Error::simple(ErrorKind::Communication))
    }

    pub fn try_recv(&mut self) -> Result<Option<Message<O>>> {
        match self.inner.try_recv() {
            Ok(m) => Ok(Some(m)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(Error::simple(ErrorKind::Communication))
            }
        }
    }
}

/// Creates a bounded channel pair feeding `Message<O>` events to a
/// single consumer.
pub fn new_message_channel<O>(bound: usize) -> (MessageChannelTx<O>, MessageChannelRx<O>) {
    let (tx, rx) = mpsc::channel(bound.max(1));
    (MessageChannelTx { inner: tx }, MessageChannelRx { inner: rx })
}
