//! WebSocket transport adapter.
//!
//! One `read` returns one complete message; control frames are no-op
//! reads. WebSocket channels are single-strike: any read error ends
//! the read loop, so the per-read deadline amortizes the configured
//! timeout across the retries other protocols get to spend.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::packet::{PacketBody, Protocol, WsMsgKind};

use super::Transport;

pub struct WsTransport<S> {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocketStream<S>>>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws_stream: WebSocketStream<S>,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Self {
        let (sink, stream) = ws_stream.split();
        WsTransport {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            local,
            remote,
        }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    async fn read(&self, _config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError> {
        let message = self.stream.lock().await.next().await;
        match message {
            Some(Ok(Message::Binary(data))) => Ok(Some(PacketBody::Ws {
                kind: WsMsgKind::Binary,
                data: Bytes::from(data),
            })),
            Some(Ok(Message::Text(text))) => Ok(Some(PacketBody::Ws {
                kind: WsMsgKind::Text,
                data: Bytes::from(text.into_bytes()),
            })),
            // Control frames are handled by the protocol stack.
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(None),
            Some(Ok(Message::Close(_))) | None => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "websocket closed by peer",
            ))),
            Some(Err(err)) => Err(ChannelError::Ws(err)),
        }
    }

    async fn write(&self, body: &PacketBody, _config: &ChannelConfig) -> Result<usize, ChannelError> {
        let (kind, data) = match body {
            PacketBody::Ws { kind, data } => (*kind, data),
            other => {
                return Err(ChannelError::ProtocolMismatch {
                    channel: Protocol::Ws,
                    packet: other.protocol(),
                })
            }
        };
        let message = match kind {
            WsMsgKind::Binary => Message::Binary(data.to_vec()),
            WsMsgKind::Text => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|_| ChannelError::Frame("text payload is not valid utf-8".into()))?;
                Message::Text(text)
            }
        };
        self.sink.lock().await.send(message).await?;
        Ok(data.len())
    }

    fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
        // Text is the default kind; callers flip to binary per packet.
        Ok(PacketBody::Ws {
            kind: WsMsgKind::Text,
            data,
        })
    }

    fn read_timeout(&self, config: &ChannelConfig) -> Duration {
        config.read_timeout * config.max_read_failures
    }

    fn read_continues(&self, _consecutive_failures: u32, _config: &ChannelConfig) -> bool {
        false
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
