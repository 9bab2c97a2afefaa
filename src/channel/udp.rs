//! UDP transport adapters.
//!
//! The dialing side wraps a connected socket: one datagram per read,
//! one per write. Server-side peers do not own a socket at all: the
//! strap's demultiplexer task feeds each peer channel a bounded queue
//! of datagrams and writes go out through the shared listening socket.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::packet::{PacketBody, Protocol};

use super::Transport;

/// Connected-socket adapter used by the UDP client strap.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, remote: SocketAddr) -> Result<Self, ChannelError> {
        let local = socket.local_addr()?;
        Ok(UdpTransport {
            socket,
            local,
            remote,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn read(&self, config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError> {
        let mut buf = vec![0u8; config.read_buf_size];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Some(PacketBody::Udp(Bytes::from(buf))))
    }

    async fn write(&self, body: &PacketBody, _config: &ChannelConfig) -> Result<usize, ChannelError> {
        let data = body.data();
        let n = self.socket.send(data).await?;
        Ok(n)
    }

    fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
        Ok(PacketBody::Udp(data))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) {}
}

/// Per-peer adapter used by the UDP server strap. Reads come from the
/// demultiplexer's queue; writes go through the shared listening
/// socket with this peer as destination.
pub struct UdpPeerTransport {
    socket: Arc<UdpSocket>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl UdpPeerTransport {
    pub fn new(
        socket: Arc<UdpSocket>,
        inbox: mpsc::Receiver<Bytes>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        UdpPeerTransport {
            socket,
            inbox: tokio::sync::Mutex::new(inbox),
            local,
            peer,
        }
    }
}

#[async_trait]
impl Transport for UdpPeerTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn read(&self, _config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError> {
        match self.inbox.lock().await.recv().await {
            Some(datagram) => Ok(Some(PacketBody::Udp(datagram))),
            None => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer queue closed",
            ))),
        }
    }

    async fn write(&self, body: &PacketBody, _config: &ChannelConfig) -> Result<usize, ChannelError> {
        let data = body.data();
        let n = self.socket.send_to(data, self.peer).await?;
        Ok(n)
    }

    fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
        Ok(PacketBody::Udp(data))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn close(&self) {}
}
