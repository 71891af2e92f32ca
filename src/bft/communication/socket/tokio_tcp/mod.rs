use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bft::error::*;

pub struct Socket {
    inner: TcpStream,
}

pub struct Listener {
    inner: TcpListener,
}

pub fn init() -> Result<()> {
    Ok(())
}

pub fn drop() {}

pub async fn bind(addr: SocketAddr) -> Result<Listener> {
    let inner = TcpListener::bind(addr)
        .await
        .wrapped(ErrorKind::CommunicationSocket)?;
    Ok(Listener { inner })
}

pub async fn connect(addr: SocketAddr) -> Result<Socket> {
    let inner = TcpStream::connect(addr)
        .await
        .wrapped(ErrorKind::CommunicationSocket)?;
    inner.set_nodelay(true).wrapped(ErrorKind::CommunicationSocket)?;
    Ok(Socket { inner })
}

impl Listener {
    pub async fn accept(&self) -> Result<Socket> {
        let (inner, _addr) = self
            .inner
            .accept()
            .await
            .wrapped(ErrorKind::CommunicationSocket)?;
        inner.set_nodelay(true).wrapped(ErrorKind::CommunicationSocket)?;
        Ok(Socket { inner })
    }
}

impl Socket {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .await
            .map(|_| ())
            .wrapped(ErrorKind::CommunicationSocket)
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner
            .write_all(buf)
            .await
            .wrapped(ErrorKind::CommunicationSocket)
    }
}
