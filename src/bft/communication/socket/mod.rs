//! Plain TCP sockets, used as the transport for signed message
//! envelopes.
//!
//! Unlike the teacher crate this workspace descends from, no TLS layer
//! sits on top of the socket: every message is individually signed
//! with the sender's Ed25519 key (see
//! [`crate::bft::crypto::signature`]), so authenticity and integrity
//! are guaranteed per-message rather than per-connection. A deployment
//! that also wants confidentiality in transit should terminate it at
//! a layer below this one (e.g. a VPN, or a TLS-terminating proxy).

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_tokio_tcp")]
use self::tokio_tcp as backend;

use std::net::SocketAddr;

use crate::bft::error::*;

pub struct Socket {
    inner: backend::Socket,
}

pub struct Listener {
    inner: backend::Listener,
}

/// Per-process socket backend setup. A no-op for the tokio TCP backend,
/// which needs no global state beyond the async runtime itself.
pub fn init() -> Result<()> {
    backend::init()
}

/// Counterpart to [`init`].
pub fn drop() {
    backend::drop()
}

pub async fn bind(addr: SocketAddr) -> Result<Listener> {
    Ok(Listener {
        inner: backend::bind(addr).await?,
    })
}

pub async fn connect(addr: SocketAddr) -> Result<Socket> {
    Ok(Socket {
        inner: backend::connect(addr).await?,
    })
}

impl Listener {
    pub async fn accept(&self) -> Result<Socket> {
        Ok(Socket {
            inner: self.inner.accept().await?,
        })
    }
}

impl Socket {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).await
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf).await
    }
}
