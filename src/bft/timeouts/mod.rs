//! Timeout scheduling for sub-protocols that need to retry a request
//! when peers don't answer quickly enough: state transfer and
//! view-change.

use std::time::Duration;

use crate::bft::async_runtime as rt;
use crate::bft::communication::channel::MessageChannelTx;
use crate::bft::communication::message::Message;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::SeqNo;

/// Identifies what a scheduled timeout is for, so the replica actor
/// can tell a stale timeout (for a request that has since completed)
/// apart from a live one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeoutKind {
    /// The failure detector's single outstanding deadline, identified
    /// by the oldest not-yet-executed request it is watching.
    Request(Digest),
    /// A state-transfer request, identified by its CST sequence
    /// number.
    Cst(SeqNo),
    /// A view-change request, identified by the view being requested.
    ViewChange(SeqNo),
}

/// A handle used to schedule timeouts that eventually get delivered
/// back to the replica actor as [`Message::Timeout`] events.
pub struct TimeoutsHandle<O> {
    tx: MessageChannelTx<O>,
}

impl<O> Clone for TimeoutsHandle<O> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<O> TimeoutsHandle<O>
where
    O: Send + 'static,
{
    pub fn new(tx: MessageChannelTx<O>) -> Self {
        Self { tx }
    }

    /// Schedules a timeout to fire after `duration`, unless cancelled
    /// beforehand by the completion of whatever `kind` identifies.
    pub fn timeout(&self, duration: Duration, kind: TimeoutKind) {
        let mut tx = self.tx.clone();
        rt::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(Message::Timeout(kind)).await;
        });
    }
}
