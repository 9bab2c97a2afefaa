//! TCP transport adapter: raw byte batches, one `read` per buffer
//! fill.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::packet::{PacketBody, Protocol};

use super::Transport;

pub struct TcpTransport {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self, ChannelError> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(TcpTransport {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(Some(writer)),
            local,
            remote,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn read(&self, config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError> {
        let mut buf = vec![0u8; config.read_buf_size];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        buf.truncate(n);
        Ok(Some(PacketBody::Tcp(Bytes::from(buf))))
    }

    async fn write(&self, body: &PacketBody, _config: &ChannelConfig) -> Result<usize, ChannelError> {
        let data = body.data();
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(data).await?;
                Ok(data.len())
            }
            None => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection already closed",
            ))),
        }
    }

    fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
        Ok(PacketBody::Tcp(data))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
