//! KCP transport adapter, also carrying the KWS00 variant.
//!
//! KCP is treated as an opaque reliable-message transport; the stream
//! comes from `tokio_kcp`. A segment read of 8 bytes or less is a
//! keepalive artifact of the conversation layer and is treated as an
//! empty read, not a failure. When a frame codec is attached the
//! adapter speaks KWS00: every segment decodes into a typed frame on
//! ingress and frames encode back to segments on egress.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_kcp::KcpStream;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::frame::FrameCodec;
use crate::packet::{PacketBody, Protocol};

use super::Transport;

/// Reads at or below this size carry no application payload.
const KCP_EMPTY_READ_LIMIT: usize = 8;

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

/// Process-wide session counter used in channel ids; the underlying
/// stack does not expose the KCP conversation id.
pub(crate) fn next_session_id() -> u32 {
    NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
}

/// Channel id in `local:remote:session` form.
pub(crate) fn kcp_channel_id(local: Option<SocketAddr>, remote: SocketAddr, session: u32) -> String {
    match local {
        Some(local) => format!("{local}:{remote}:{session}"),
        None => format!("-:{remote}:{session}"),
    }
}

pub struct KcpTransport {
    reader: tokio::sync::Mutex<ReadHalf<KcpStream>>,
    writer: tokio::sync::Mutex<WriteHalf<KcpStream>>,
    local: Option<SocketAddr>,
    remote: SocketAddr,
    session: u32,
    codec: Option<Arc<dyn FrameCodec>>,
}

impl KcpTransport {
    /// Plain KCP adapter.
    pub fn new(stream: KcpStream, local: Option<SocketAddr>, remote: SocketAddr, session: u32) -> Self {
        Self::build(stream, local, remote, session, None)
    }

    /// KWS00 adapter: same segments, decoded through the codec.
    pub fn kws00(
        stream: KcpStream,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        session: u32,
        codec: Arc<dyn FrameCodec>,
    ) -> Self {
        Self::build(stream, local, remote, session, Some(codec))
    }

    fn build(
        stream: KcpStream,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        session: u32,
        codec: Option<Arc<dyn FrameCodec>>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        KcpTransport {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            local,
            remote,
            session,
            codec,
        }
    }

    pub fn session(&self) -> u32 {
        self.session
    }
}

#[async_trait]
impl Transport for KcpTransport {
    fn protocol(&self) -> Protocol {
        if self.codec.is_some() {
            Protocol::Kws00
        } else {
            Protocol::Kcp
        }
    }

    async fn read(&self, config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError> {
        let mut buf = vec![0u8; config.read_buf_size];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n <= KCP_EMPTY_READ_LIMIT {
            return Ok(None);
        }
        buf.truncate(n);
        let raw = Bytes::from(buf);
        match &self.codec {
            Some(codec) => {
                let frame = codec.decode(&raw)?;
                Ok(Some(PacketBody::Kws00 { raw, frame }))
            }
            None => Ok(Some(PacketBody::Kcp(raw))),
        }
    }

    async fn write(&self, body: &PacketBody, _config: &ChannelConfig) -> Result<usize, ChannelError> {
        let data = match (body, &self.codec) {
            (PacketBody::Kws00 { frame, .. }, Some(codec)) => codec.encode(frame),
            _ => body.data().clone(),
        };
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        Ok(data.len())
    }

    fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
        match &self.codec {
            Some(codec) => {
                let frame = codec.decode(&data)?;
                Ok(PacketBody::Kws00 { raw: data, frame })
            }
            None => Ok(PacketBody::Kcp(data)),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}
