//! UDP implementation of [`Transport`].
//!
//! [`UdpEndpoint`] is a thin wrapper around a connected
//! `tokio::net::UdpSocket`.  Connecting filters out datagrams from anyone but
//! the configured peer, so the engines never look at source addresses.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};

use crate::transport::{Transport, TransportError};

/// A connected, datagram-oriented UDP endpoint.
#[derive(Debug)]
pub struct UdpEndpoint {
    /// Address this socket is bound to (filled in after the OS assigns a port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl UdpEndpoint {
    /// Bind an unconnected endpoint to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, TransportError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Fix the peer all sends go to and all receives come from.
    pub async fn connect(&self, peer: SocketAddr) -> Result<(), TransportError> {
        self.inner.connect(peer).await?;
        log::debug!("[socket] {} connected to {peer}", self.local_addr);
        Ok(())
    }

    /// Bind `0.0.0.0:local_port` and connect to `peer_host:peer_port`.
    pub async fn open(
        local_port: u16,
        peer_host: &str,
        peer_port: u16,
    ) -> Result<Self, TransportError> {
        let peer = resolve(peer_host, peer_port).await?;
        let endpoint = Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port))).await?;
        endpoint.connect(peer).await?;
        Ok(endpoint)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.peer_addr()?)
    }
}

#[async_trait]
impl Transport for UdpEndpoint {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        self.inner.send(datagram).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.inner.recv(buf).await?)
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let target = format!("{host}:{port}");
    let found = lookup_host(target.as_str())
        .await
        .map_err(|_| TransportError::Resolve(target.clone()))?
        .find(SocketAddr::is_ipv4);
    found.ok_or(TransportError::Resolve(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_localhost() {
        let addr = resolve("127.0.0.1", 4242).await.unwrap();
        assert_eq!(addr, "127.0.0.1:4242".parse().unwrap());
    }

    #[tokio::test]
    async fn connected_pair_exchanges_datagrams() {
        let a = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        a.connect(b.local_addr).await.unwrap();
        b.connect(a.local_addr).await.unwrap();
        assert_eq!(a.peer_addr().unwrap(), b.local_addr);

        a.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
